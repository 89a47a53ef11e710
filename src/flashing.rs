//! Cartridge dumping and flashing logic.
//!
//! A [`Flashing`] session owns the transport and runs one blocking operation
//! at a time. Progress and device text go to the [`Reporter`] passed with
//! every call; chunk loops stop at the next chunk boundary once the
//! [`CancelToken`] fires.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DATA_CHUNK_SIZE, FILTERED_MESSAGES, SRAM_SIZE, TAIL_CHUNKS, markers, timeouts,
};
use crate::device::FlashId;
use crate::error::{Error, Result};
use crate::geometry::{PageCursor, SizeCode};
use crate::image::{self, ERASED_BYTE};
use crate::ownership::FileFinisher;
use crate::protocol::{Command, EraseSpan, SramSize};
use crate::report::{CancelToken, Reporter};
use crate::transport::{SerialTransport, Transport, UsbTransport};

/// Host side delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Timeout of a single transport read; silence is counted in these steps.
    pub poll_interval: Duration,
    /// Pause between the steps of device initialisation.
    pub settle: Duration,
    /// Pause between a data chunk and its write command.
    pub write_delay: Duration,
    /// Pause after a completion marker before the final drain.
    pub cleanup_delay: Duration,
    /// Pause before the last-chance read of an empty final chunk.
    pub tail_retry_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            poll_interval: Duration::from_millis(30),
            settle: Duration::from_millis(100),
            write_delay: Duration::from_millis(1),
            cleanup_delay: Duration::from_millis(100),
            tail_retry_delay: Duration::from_millis(200),
        }
    }
}

impl Timing {
    /// No sleeping at all. Silence is still accounted per poll interval, so
    /// timeouts behave the same against a transport that answers instantly.
    pub fn immediate() -> Self {
        Timing {
            settle: Duration::ZERO,
            write_delay: Duration::ZERO,
            cleanup_delay: Duration::ZERO,
            tail_retry_delay: Duration::ZERO,
            ..Timing::default()
        }
    }
}

/// What the tail reader wants after one read.
#[derive(Debug, PartialEq, Eq)]
enum TailStep {
    More,
    Complete,
    Failed(String),
}

/// Accumulate-with-deadline state for the last chunks of a ROM dump.
///
/// The dumper's final transfers often arrive fragmented or late, so instead
/// of demanding a full chunk this accepts a short one once the link has been
/// quiet for a while, and tolerates early transport errors on the last chunk.
#[derive(Debug)]
struct TailRead {
    last: bool,
    got: usize,
    silence_ms: u32,
}

impl TailRead {
    fn new(last: bool) -> Self {
        TailRead {
            last,
            got: 0,
            silence_ms: 0,
        }
    }

    fn ceiling_ms(&self) -> u32 {
        if self.last {
            timeouts::LAST_TAIL_MS
        } else {
            timeouts::TAIL_MS
        }
    }

    fn settle_ms(&self) -> u32 {
        if self.last {
            timeouts::LAST_TAIL_SETTLE_MS
        } else {
            timeouts::TAIL_SETTLE_MS
        }
    }

    fn on_read(&mut self, outcome: anyhow::Result<usize>, poll_ms: u32) -> TailStep {
        match outcome {
            Ok(0) => {
                self.silence_ms += poll_ms;
                if self.got > 0 && self.silence_ms > self.settle_ms() {
                    return TailStep::Complete;
                }
            }
            Ok(n) => {
                self.got += n;
                self.silence_ms = 0;
                if self.got >= DATA_CHUNK_SIZE {
                    return TailStep::Complete;
                }
            }
            Err(_) if self.got > 0 => return TailStep::Complete,
            Err(e) if self.last && self.silence_ms < timeouts::LAST_TAIL_ERROR_GRACE_MS => {
                log::trace!("tail read error tolerated: {:#}", e);
                self.silence_ms += poll_ms * 2;
            }
            Err(e) => return TailStep::Failed(format!("{:#}", e)),
        }
        if self.silence_ms >= self.ceiling_ms() {
            TailStep::Complete
        } else {
            TailStep::More
        }
    }
}

pub struct Flashing<T: Transport> {
    transport: T,
    timing: Timing,
    verbose: bool,
    finisher: Option<Box<dyn FileFinisher>>,
    /// Device text not yet terminated by a newline.
    pending_text: String,
    /// Received bytes that followed a line and belong to the next read.
    pending_rx: Vec<u8>,
}

impl Flashing<UsbTransport> {
    pub fn open_usb() -> Result<Self> {
        let transport = UsbTransport::open_any()?;
        Ok(Flashing::new(transport))
    }
}

impl Flashing<SerialTransport> {
    /// Opens `port`, or the first port with the dumper's USB IDs.
    pub fn open_serial(port: Option<&str>) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port)?,
            None => SerialTransport::open_any()?,
        };
        Ok(Flashing::new(transport))
    }
}

impl<T: Transport> Flashing<T> {
    pub fn new(transport: T) -> Self {
        Flashing {
            transport,
            timing: Timing::default(),
            verbose: false,
            finisher: None,
            pending_text: String::new(),
            pending_rx: Vec::new(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Show every line the device prints, including the chatty ones.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Hook run on every output file once it is complete.
    pub fn set_finisher(&mut self, finisher: Box<dyn FileFinisher>) {
        self.finisher = Some(finisher);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ends the session, releasing the transport.
    pub fn close(self) -> T {
        self.transport
    }

    pub fn connect(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.handshake(reporter);
        self.conclude(reporter, "Connect", result)
    }

    /// Queries the flash chip. `None` when the device printed no usable ID.
    pub fn check_id(&mut self, reporter: &mut dyn Reporter) -> Result<Option<FlashId>> {
        let result = self.query_id(reporter);
        self.conclude(reporter, "Chip ID query", result)
    }

    pub fn clear_buffer(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.reset_buffer(reporter);
        self.conclude(reporter, "Buffer clear", result)
    }

    /// Connect, check ID, clear buffer. Every transfer operation starts with
    /// this already.
    pub fn device_init(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.init(reporter);
        self.conclude(reporter, "Device init", result)
    }

    /// Dumps the ROM into `path`. `size_kb == 0` reads 4M and trims.
    ///
    /// Returns the final file length.
    pub fn read_rom(
        &mut self,
        path: impl AsRef<Path>,
        size_kb: u32,
        no_trim: bool,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let result = self.dump_rom(path.as_ref(), size_kb, no_trim, reporter, cancel);
        self.conclude(reporter, "ROM read", result)
    }

    /// Programs the image at `path`, at most `size_kb` KB of it when non-zero.
    /// The target must be erased first.
    ///
    /// Returns the number of image bytes sent.
    pub fn write_rom(
        &mut self,
        path: impl AsRef<Path>,
        size_kb: u32,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let result = self.program_rom(path.as_ref(), size_kb, reporter, cancel);
        self.conclude(reporter, "ROM write", result)
    }

    pub fn read_sram(
        &mut self,
        path: impl AsRef<Path>,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let result = self.dump_sram(path.as_ref(), reporter, cancel);
        self.conclude(reporter, "SRAM read", result)
    }

    pub fn write_sram(
        &mut self,
        path: impl AsRef<Path>,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let result = self.restore_sram(path.as_ref(), reporter, cancel);
        self.conclude(reporter, "SRAM write", result)
    }

    /// Erases `size_kb` (rounded up to a cartridge size) worth of sectors,
    /// or the whole chip and the SRAM when `size_kb == 0`.
    pub fn erase(&mut self, size_kb: u32, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.erase_span(size_kb, reporter);
        self.conclude(reporter, "Erase", result)
    }

    /// Erases the single sector containing word address `address`.
    pub fn erase_sector(&mut self, address: u32, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.erase_one(address, reporter);
        self.conclude(reporter, "Sector erase", result)
    }

    fn conclude<R>(
        &mut self,
        reporter: &mut dyn Reporter,
        what: &str,
        result: Result<R>,
    ) -> Result<R> {
        self.flush_text(reporter);
        match &result {
            Ok(_) => {}
            Err(Error::Interrupted) => reporter.on_message(&format!("{} interrupted", what), true),
            Err(e) => reporter.on_message(&format!("{} failed: {}", what, e), true),
        }
        result
    }

    fn handshake(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        reporter.on_message("Connecting to FlashMaster MD Dumper...", false);
        self.send(Command::Connect)?;
        let response = self.read_line(timeouts::CONNECT_MS)?;
        self.device_text(reporter, response.as_bytes());
        if response.contains(markers::CONNECTED) {
            reporter.on_message("Connection successful!", false);
            Ok(())
        } else {
            Err(Error::Timeout("no response from device".into()))
        }
    }

    fn query_id(&mut self, reporter: &mut dyn Reporter) -> Result<Option<FlashId>> {
        reporter.on_message("Reading flash chip ID...", false);
        self.send(Command::CheckId)?;
        let text = self.drain(reporter, timeouts::CHECK_ID_DRAIN_MS);
        let id = text
            .split(markers::FLASH_ID)
            .nth(1)
            .and_then(FlashId::parse);
        match id.as_ref().and_then(FlashId::chip) {
            Some(chip) => log::info!("Chip: {}, {} KB", chip, chip.size / 1024),
            None => log::debug!("no known flash chip, id {:?}", id),
        }
        Ok(id)
    }

    fn reset_buffer(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        reporter.on_message("Clearing device buffer...", false);
        self.send(Command::ClearBuffer)?;
        self.drain(reporter, timeouts::CLEAR_BUFFER_DRAIN_MS);
        Ok(())
    }

    fn init(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        self.handshake(reporter).inspect_err(|_| {
            reporter.on_message("Failed to connect to device", true);
        })?;
        self.pause(self.timing.settle);
        self.query_id(reporter).inspect_err(|_| {
            reporter.on_message("Failed to read device ID", true);
        })?;
        self.pause(self.timing.settle);
        self.reset_buffer(reporter).inspect_err(|_| {
            reporter.on_message("Failed to clear device buffer", true);
        })
    }

    fn dump_rom(
        &mut self,
        path: &Path,
        size_kb: u32,
        no_trim: bool,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        check_path(path)?;
        let auto = size_kb == 0;
        let (size, total) = match SizeCode::from_kb(size_kb) {
            None => {
                reporter.on_message(
                    "Auto-detecting ROM size by reading 4MB and trimming...",
                    false,
                );
                (SizeCode::M4, SizeCode::M4.bytes() as u64)
            }
            Some(size) => {
                reporter.on_message(
                    &format!("Reading {} KB ROM to {}...", size_kb, path.display()),
                    false,
                );
                (size, (size_kb as u64 * 1024).min(size.bytes() as u64))
            }
        };

        self.init(reporter)?;
        let mut file = File::create(path).map_err(Error::File)?;

        self.send(Command::read_rom(size))?;
        let status = self.read_line(timeouts::STATUS_LINE_MS)?;
        self.device_text(reporter, status.as_bytes());

        let chunks = size.chunks() as usize;
        let mut buf = [0u8; DATA_CHUNK_SIZE];
        let mut saved = 0u64;
        for i in 0..chunks {
            if cancel.is_cancelled() {
                file.sync_all().map_err(Error::File)?;
                self.finish_file(path);
                return Err(Error::Interrupted);
            }
            let got = if i >= chunks - TAIL_CHUNKS {
                self.read_tail_chunk(&mut buf, i, i == chunks - 1)?
            } else {
                self.read_exact_chunk(&mut buf, i)?;
                DATA_CHUNK_SIZE
            };
            if got == 0 {
                log::debug!("stream ended before chunk {}", i);
                break;
            }
            let n = (got as u64).min(total - saved) as usize;
            file.write_all(&buf[..n]).map_err(Error::File)?;
            saved += n as u64;
            reporter.on_progress(saved, total);
        }

        let exact = no_trim && !auto;
        if exact && saved != total {
            image::fit_to_len(&mut file, total).map_err(Error::File)?;
            saved = total;
        }
        file.sync_all().map_err(Error::File)?;
        drop(file);
        self.finish_file(path);

        self.drain(reporter, timeouts::READ_DRAIN_MS);
        reporter.on_message(
            &format!("ROM read complete: {} bytes written to {}", saved, path.display()),
            false,
        );

        if exact {
            reporter.on_message(
                &format!("File size preserved at exactly {} KB (no trimming)", total / 1024),
                false,
            );
            return Ok(saved);
        }

        reporter.on_message("Attempting to trim ROM file...", false);
        let len = image::trim_file(path).map_err(Error::File)?;
        if len < saved {
            reporter.on_message(&format!("ROM file trimmed to {} bytes.", len), false);
        } else {
            reporter.on_message("ROM file has no trailing 0xFF padding.", false);
        }
        self.finish_file(path);
        Ok(len)
    }

    fn program_rom(
        &mut self,
        path: &Path,
        size_kb: u32,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        check_path(path)?;
        self.init(reporter)?;

        let mut file = File::open(path).map_err(Error::File)?;
        let file_len = file.metadata().map_err(Error::File)?.len();
        if file_len == 0 {
            return Err(Error::File(io::Error::new(
                io::ErrorKind::InvalidData,
                "ROM image is empty",
            )));
        }
        let write_size = match size_kb {
            0 => file_len,
            kb => (kb as u64 * 1024).min(file_len),
        };
        if write_size > SizeCode::M8.bytes() as u64 {
            return Err(Error::InvalidParam(format!(
                "{} bytes do not fit the largest cartridge",
                write_size
            )));
        }
        reporter.on_message(
            &format!("Writing {} bytes from {} to flash...", write_size, path.display()),
            false,
        );

        let written = self.send_chunks(
            &mut file,
            write_size,
            ERASED_BYTE,
            reporter,
            cancel,
            |cursor| Command::write_rom(cursor.page, cursor.bank),
        )?;

        self.send(Command::ClearBuffer)?;
        self.drain(reporter, timeouts::WRITE_DRAIN_MS);
        reporter.on_message(&format!("ROM write complete: {} bytes written", written), false);
        Ok(written)
    }

    fn dump_sram(
        &mut self,
        path: &Path,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        check_path(path)?;
        self.init(reporter)?;

        let mut file = File::create(path).map_err(Error::File)?;
        reporter.on_message(&format!("Reading 32K SRAM to {}...", path.display()), false);

        self.send(Command::ReadSram { size: SramSize::K32 })?;
        let status = self.read_line(timeouts::STATUS_LINE_MS)?;
        self.device_text(reporter, status.as_bytes());

        let total = SRAM_SIZE as u64;
        let mut buf = [0u8; DATA_CHUNK_SIZE];
        let mut received = 0u64;
        for i in 0..SRAM_SIZE / DATA_CHUNK_SIZE {
            if cancel.is_cancelled() {
                file.sync_all().map_err(Error::File)?;
                self.finish_file(path);
                return Err(Error::Interrupted);
            }
            self.read_exact_chunk(&mut buf, i)?;
            file.write_all(&buf).map_err(Error::File)?;
            received += DATA_CHUNK_SIZE as u64;
            reporter.on_progress(received, total);
        }

        file.sync_all().map_err(Error::File)?;
        drop(file);
        self.finish_file(path);

        self.drain(reporter, timeouts::READ_DRAIN_MS);
        reporter.on_message(
            &format!("SRAM read complete: {} bytes written to {}", received, path.display()),
            false,
        );
        Ok(received)
    }

    fn restore_sram(
        &mut self,
        path: &Path,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        check_path(path)?;
        self.init(reporter)?;

        let mut file = File::open(path).map_err(Error::File)?;
        let mut len = file.metadata().map_err(Error::File)?.len();
        if len > SRAM_SIZE as u64 {
            len = SRAM_SIZE as u64;
            reporter.on_message("Warning: File truncated to 32K", false);
        }
        reporter.on_message(
            &format!("Writing {} bytes from {} to SRAM...", len, path.display()),
            false,
        );

        let written = self.send_chunks(&mut file, len, 0x00, reporter, cancel, |cursor| {
            Command::write_sram(cursor.page, cursor.bank)
        })?;

        self.send(Command::ClearBuffer)?;
        self.drain(reporter, timeouts::WRITE_DRAIN_MS);
        reporter.on_message(&format!("SRAM write complete: {} bytes written", written), false);
        Ok(written)
    }

    /// Streams `len` bytes of `file` as padded chunks, each followed by the
    /// write command `command` builds for its page. ROM writes must be
    /// acknowledged; SRAM acknowledgements are only logged.
    fn send_chunks<F>(
        &mut self,
        file: &mut File,
        len: u64,
        pad: u8,
        reporter: &mut dyn Reporter,
        cancel: &CancelToken,
        command: F,
    ) -> Result<u64>
    where
        F: Fn(&PageCursor) -> Command,
    {
        let mut cursor = PageCursor::default();
        let mut buf = [0u8; DATA_CHUNK_SIZE];
        let mut written = 0u64;

        while written < len {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let n = (len - written).min(DATA_CHUNK_SIZE as u64) as usize;
            buf.fill(pad);
            file.read_exact(&mut buf[..n]).map_err(Error::File)?;

            self.transport.send_raw(&buf).map_err(Error::io)?;
            self.pause(self.timing.write_delay);
            let cmd = command(&cursor);
            let must_ack = matches!(cmd, Command::WriteRom { .. });
            self.send(cmd)?;

            let ack = self.read_line(timeouts::ACK_MS)?;
            if ack.is_empty() {
                if must_ack {
                    return Err(Error::Timeout(format!("no response at offset {}", written)));
                }
                log::warn!("no acknowledgement at offset {}", written);
            } else {
                log::debug!("<= {}", ack.trim_end());
            }

            written += n as u64;
            cursor.advance();
            reporter.on_progress(written, len);
        }
        Ok(written)
    }

    fn erase_span(&mut self, size_kb: u32, reporter: &mut dyn Reporter) -> Result<()> {
        self.init(reporter)?;
        match SizeCode::from_kb(size_kb) {
            None => {
                reporter.on_message(
                    "Performing full chip erase (this may take 1-2 minutes)...",
                    false,
                );
                self.send(Command::EraseFull)?;
                self.wait_for(reporter, markers::FULL_ERASE_DONE, timeouts::FULL_ERASE_MS)?;
                reporter.on_message("Full chip erase complete", false);
            }
            Some(size) => {
                reporter.on_message(
                    &format!(
                        "Erasing {} KB (using {} KB sector)...",
                        size_kb,
                        size.bytes() / 1024
                    ),
                    false,
                );
                self.send(Command::EraseBySize(EraseSpan::Size(size)))?;
                self.wait_for(reporter, markers::ERASE_DONE, timeouts::SIZE_ERASE_MS)?;
                reporter.on_message(&format!("Erased {}", size), false);
            }
        }
        Ok(())
    }

    fn erase_one(&mut self, address: u32, reporter: &mut dyn Reporter) -> Result<()> {
        if address > crate::geometry::ADDRESS_MASK {
            return Err(Error::InvalidParam(format!(
                "sector address 0x{:x} is beyond the bus",
                address
            )));
        }
        self.init(reporter)?;
        reporter.on_message(&format!("Erasing sector at 0x{:06X}...", address), false);
        self.send(Command::erase_sector(address))?;
        self.wait_for(reporter, markers::ERASE_DONE, timeouts::SIZE_ERASE_MS)
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        self.transport.send_command(cmd).map_err(Error::io)
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.fill(buf, Duration::from_millis(timeout_ms as u64))
            .map_err(Error::io)
    }

    /// Hands out carried-over bytes before asking the transport.
    fn fill(&mut self, buf: &mut [u8], timeout: Duration) -> anyhow::Result<usize> {
        if self.pending_rx.is_empty() {
            return self.transport.recv_raw(buf, timeout);
        }
        let n = buf.len().min(self.pending_rx.len());
        buf[..n].copy_from_slice(&self.pending_rx[..n]);
        self.pending_rx.drain(..n);
        Ok(n)
    }

    /// Puts bytes back in front of everything not yet read.
    fn unread(&mut self, bytes: &[u8]) {
        self.pending_rx.splice(0..0, bytes.iter().copied());
    }

    fn poll_ms(&self) -> u32 {
        (self.timing.poll_interval.as_millis() as u32).max(1)
    }

    fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// One response line, or whatever arrived before `timeout_ms` of silence.
    /// Bytes after the newline stay buffered for the next read.
    fn read_line(&mut self, timeout_ms: u32) -> Result<String> {
        let poll = self.poll_ms();
        let mut line = Vec::new();
        let mut buf = [0u8; 256];
        let mut silence = 0;
        while silence < timeout_ms {
            let n = self.recv(&mut buf, poll)?;
            if n == 0 {
                silence += poll;
                continue;
            }
            if let Some(pos) = buf[..n].iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..=pos]);
                self.unread(&buf[pos + 1..n]);
                break;
            }
            line.extend_from_slice(&buf[..n]);
            silence = 0;
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Shows device text until `done` shows up, then drains what follows.
    /// Fails once `timeout_ms` pass without data, or when the device reports
    /// that the erase gave up.
    fn wait_for(&mut self, reporter: &mut dyn Reporter, done: &str, timeout_ms: u32) -> Result<()> {
        let poll = self.poll_ms();
        let mut seen: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        let mut silence = 0;

        while silence < timeout_ms {
            let n = self.recv(&mut buf, poll)?;
            if n == 0 {
                silence += poll;
                continue;
            }
            silence = 0;
            self.device_text(reporter, &buf[..n]);
            seen.extend_from_slice(&buf[..n]);

            if contains(&seen, markers::ERASE_FAILED) {
                return Err(Error::Timeout("device gave up waiting for the erase".into()));
            }
            if contains(&seen, done) {
                self.pause(self.timing.cleanup_delay);
                loop {
                    let n = self.recv(&mut buf, timeouts::MARKER_DRAIN_READ_MS)?;
                    if n == 0 {
                        break;
                    }
                    self.device_text(reporter, &buf[..n]);
                }
                return Ok(());
            }
            // markers are short, keep only a tail to match across reads
            if seen.len() > 1024 {
                seen.drain(..seen.len() - 64);
            }
        }
        Err(Error::Timeout(format!("waiting for \"{}\"", done)))
    }

    /// Shows device text until `timeout_ms` of silence and returns it.
    fn drain(&mut self, reporter: &mut dyn Reporter, timeout_ms: u32) -> String {
        let poll = self.poll_ms();
        let mut text = String::new();
        let mut buf = [0u8; 512];
        let mut silence = 0;
        while silence < timeout_ms {
            match self.recv(&mut buf, poll) {
                Ok(n) if n > 0 => {
                    silence = 0;
                    self.device_text(reporter, &buf[..n]);
                    text.push_str(&String::from_utf8_lossy(&buf[..n]));
                }
                Ok(_) => silence += poll,
                Err(e) => {
                    log::debug!("drain: {}", e);
                    silence += poll;
                }
            }
        }
        self.flush_text(reporter);
        text
    }

    /// Strict chunk read: all of it, with no gap longer than the chunk timeout.
    fn read_exact_chunk(&mut self, buf: &mut [u8; DATA_CHUNK_SIZE], index: usize) -> Result<()> {
        let poll = self.poll_ms();
        let mut got = 0;
        let mut silence = 0;
        while got < DATA_CHUNK_SIZE {
            if silence >= timeouts::CHUNK_MS {
                return Err(Error::Timeout(format!(
                    "chunk {} stalled after {} of {} bytes",
                    index, got, DATA_CHUNK_SIZE
                )));
            }
            let n = self.recv(&mut buf[got..], poll)?;
            if n == 0 {
                silence += poll;
            } else {
                got += n;
                silence = 0;
            }
        }
        Ok(())
    }

    /// Tolerant read for the last chunks of a dump. Returns how many bytes
    /// of the chunk arrived; `0` means the stream ended before the final one.
    fn read_tail_chunk(
        &mut self,
        buf: &mut [u8; DATA_CHUNK_SIZE],
        index: usize,
        last: bool,
    ) -> Result<usize> {
        let poll = self.poll_ms();
        let mut tail = TailRead::new(last);
        loop {
            let outcome = self.fill(&mut buf[tail.got..], Duration::from_millis(poll as u64));
            match tail.on_read(outcome, poll) {
                TailStep::More => {}
                TailStep::Complete => break,
                TailStep::Failed(e) => {
                    return Err(Error::Io(format!("reading chunk {} (near end): {}", index, e)));
                }
            }
        }
        log::trace!("tail chunk {}: {} bytes, {} ms quiet", index, tail.got, tail.silence_ms);

        if tail.got > 0 {
            return Ok(tail.got);
        }
        if !last {
            return Err(Error::Timeout(format!("got no data for chunk {}", index)));
        }
        self.pause(self.timing.tail_retry_delay);
        match self.fill(
            &mut buf[..],
            Duration::from_millis(timeouts::LAST_CHUNK_RETRY_MS as u64),
        ) {
            Ok(n) => Ok(n),
            Err(e) => {
                log::debug!("last chunk retry: {:#}", e);
                Ok(0)
            }
        }
    }

    fn should_filter(&self, line: &str) -> bool {
        !self.verbose && FILTERED_MESSAGES.iter().any(|m| line.contains(m))
    }

    /// Splits device output into lines and shows the unfiltered ones.
    fn device_text(&mut self, reporter: &mut dyn Reporter, bytes: &[u8]) {
        self.pending_text.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.pending_text.find('\n') {
            let line: String = self.pending_text.drain(..=pos).collect();
            self.emit_line(reporter, &line);
        }
    }

    fn flush_text(&mut self, reporter: &mut dyn Reporter) {
        if !self.pending_text.is_empty() {
            let line = std::mem::take(&mut self.pending_text);
            self.emit_line(reporter, &line);
        }
    }

    fn emit_line(&self, reporter: &mut dyn Reporter, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        if self.should_filter(line) {
            log::debug!("<= {}", line);
        } else {
            reporter.on_message(line, false);
        }
    }

    fn finish_file(&self, path: &Path) {
        if let Some(finisher) = &self.finisher {
            if let Err(e) = finisher.finish(path) {
                log::warn!("could not hand {} back to the invoking user: {}", path.display(), e);
            }
        }
    }
}

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidParam("no file name given".into()));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w == needle.as_bytes())
}
