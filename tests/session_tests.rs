use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mdflasher::constants::{CMD_PACKET_SIZE, DATA_CHUNK_SIZE, MAGIC, SRAM_SIZE};
use mdflasher::firmware::{Dispatcher, EraseLimits, SimConfig, SimulatedCart};
use mdflasher::report::{NullReporter, RecordingReporter};
use mdflasher::transport::SimTransport;
use mdflasher::{CancelToken, Error, FlashId, Flashing, Reporter, Timing, Transport};

fn session(sim: SimTransport) -> Flashing<SimTransport> {
    Flashing::new(sim).with_timing(Timing::immediate())
}

fn sim() -> Flashing<SimTransport> {
    session(SimTransport::new(SimConfig::default()))
}

fn temp_path(name: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("mdflasher-{}-{}-{}", std::process::id(), stamp, name))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + 1) % 251) as u8).collect()
}

/// Sits between the host and the simulated dumper. Records every frame the
/// host sends, can join device transfers into one byte stream like a tty,
/// and can drop all device output once a given opcode went out.
struct Tap {
    inner: SimTransport,
    sent: Vec<Vec<u8>>,
    stream: Option<VecDeque<u8>>,
    mute_after: Option<u8>,
    muted: bool,
}

impl Tap {
    fn new(inner: SimTransport) -> Self {
        Tap {
            inner,
            sent: Vec::new(),
            stream: None,
            mute_after: None,
            muted: false,
        }
    }

    fn byte_stream(mut self) -> Self {
        self.stream = Some(VecDeque::new());
        self
    }

    fn mute_after(mut self, opcode: u8) -> Self {
        self.mute_after = Some(opcode);
        self
    }

    fn pull(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.inner.recv_raw(&mut buf, Duration::ZERO)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl Transport for Tap {
    fn send_raw(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        self.sent.push(raw.to_vec());
        self.inner.send_raw(raw)?;
        if raw.len() == CMD_PACKET_SIZE && raw[1..5] == MAGIC && self.mute_after == Some(raw[0]) {
            self.muted = true;
        }
        if self.muted {
            self.pull()?;
        } else if self.stream.is_some() {
            let replies = self.pull()?;
            if let Some(stream) = self.stream.as_mut() {
                stream.extend(replies);
            }
        }
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> anyhow::Result<usize> {
        if self.muted {
            return Ok(0);
        }
        match self.stream.as_mut() {
            Some(stream) => {
                let n = buf.len().min(stream.len());
                for (dst, src) in buf.iter_mut().zip(stream.drain(..n)) {
                    *dst = src;
                }
                Ok(n)
            }
            None => self.inner.recv_raw(buf, timeout),
        }
    }
}

/// Cancels the token once `after` progress reports have come in.
struct CancelAfter {
    token: CancelToken,
    after: usize,
    seen: usize,
}

impl Reporter for CancelAfter {
    fn on_progress(&mut self, _done: u64, _total: u64) {
        self.seen += 1;
        if self.seen == self.after {
            self.token.cancel();
        }
    }

    fn on_message(&mut self, _text: &str, _is_error: bool) {}
}

#[test]
fn check_id_reads_the_chip() {
    let mut flashing = sim();
    let mut reporter = RecordingReporter::default();
    let id = flashing.check_id(&mut reporter).unwrap();
    assert_eq!(id, Some(FlashId::new(0xc2, 0xcb)));
    assert!(reporter.lines().contains(&"FLASHID:C2CB"));
    assert!(reporter.lines().iter().any(|l| l.contains("MX29LV640EB")));
}

#[test]
fn unknown_opcode_is_ignored() {
    let mut flashing = sim();
    let mut frame = [0u8; CMD_PACKET_SIZE];
    frame[0] = 0x7f;
    frame[1..5].copy_from_slice(&MAGIC);
    flashing.transport_mut().send_raw(&frame).unwrap();

    let mut reporter = RecordingReporter::default();
    flashing.connect(&mut reporter).unwrap();
    assert!(reporter.errors().is_empty());
}

#[test]
fn dump_trims_trailing_padding() {
    let mut flashing = Flashing::new(Tap::new(SimTransport::new(SimConfig::default())))
        .with_timing(Timing::immediate());
    let rom = pattern(1000);
    flashing.transport_mut().inner.cart_mut().load_rom(&rom);

    let path = temp_path("dump.bin");
    let mut reporter = RecordingReporter::default();
    let len = flashing
        .read_rom(&path, 512, false, &mut reporter, &CancelToken::new())
        .unwrap();

    // connect, id, buffer clear, then the 512K dump request
    let sent = &flashing.transport().sent;
    assert_eq!(sent.len(), 4);
    assert!(sent.iter().all(|frame| frame.len() == CMD_PACKET_SIZE));
    assert_eq!(sent[0][..5], [0x0c, 0xaa, 0x55, 0xaa, 0xbb]);
    assert_eq!(sent[1][..5], [0x0d, 0xaa, 0x55, 0xaa, 0xbb]);
    assert_eq!(sent[2][..5], [0x0f, 0xaa, 0x55, 0xaa, 0xbb]);
    assert_eq!(sent[3][..6], [0x0a, 0xaa, 0x55, 0xaa, 0xbb, 0x01]);

    assert_eq!(len, 1000);
    assert_eq!(fs::read(&path).unwrap(), rom);
    assert_eq!(reporter.progress.last(), Some(&(512 * 1024, 512 * 1024)));
    assert!(reporter.lines().contains(&"ROM file trimmed to 1000 bytes."));
    fs::remove_file(path).unwrap();
}

#[test]
fn auto_size_reads_four_megabytes() {
    let mut flashing = sim();
    flashing.transport_mut().cart_mut().load_rom(&pattern(100));

    let path = temp_path("auto.bin");
    let mut reporter = RecordingReporter::default();
    let len = flashing
        .read_rom(&path, 0, true, &mut reporter, &CancelToken::new())
        .unwrap();

    // auto size trims even when asked not to
    assert_eq!(len, 100);
    assert_eq!(reporter.progress.last(), Some(&(4 << 20, 4 << 20)));
    fs::remove_file(path).unwrap();
}

#[test]
fn write_then_read_back() {
    let mut flashing = sim();
    let image = pattern(3000);
    let src = temp_path("write.bin");
    fs::write(&src, &image).unwrap();

    let mut reporter = RecordingReporter::default();
    let written = flashing
        .write_rom(&src, 0, &mut reporter, &CancelToken::new())
        .unwrap();
    assert_eq!(written, 3000);
    assert_eq!(flashing.transport().cart().rom_image(3000), image);
    // the padded tail of the last chunk stays erased
    assert!(
        flashing.transport().cart().rom_image(3072)[3000..]
            .iter()
            .all(|&b| b == 0xff)
    );

    let dst = temp_path("readback.bin");
    let len = flashing
        .read_rom(&dst, 512, false, &mut reporter, &CancelToken::new())
        .unwrap();
    assert_eq!(len, 3000);
    assert_eq!(fs::read(&dst).unwrap(), image);
    assert!(reporter.errors().is_empty());

    fs::remove_file(src).unwrap();
    fs::remove_file(dst).unwrap();
}

#[test]
fn write_size_limits_the_image() {
    let mut flashing = sim();
    let image = pattern(4096);
    let src = temp_path("partial.bin");
    fs::write(&src, &image).unwrap();

    let written = flashing
        .write_rom(&src, 2, &mut RecordingReporter::default(), &CancelToken::new())
        .unwrap();
    assert_eq!(written, 2048);
    let rom = flashing.transport().cart().rom_image(4096);
    assert_eq!(rom[..2048], image[..2048]);
    assert!(rom[2048..].iter().all(|&b| b == 0xff));
    fs::remove_file(src).unwrap();
}

#[test]
fn empty_image_is_rejected() {
    let mut flashing = sim();
    let src = temp_path("empty.bin");
    fs::write(&src, b"").unwrap();

    let err = flashing
        .write_rom(&src, 0, &mut RecordingReporter::default(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::File(_)));
    assert_eq!(flashing.transport().cart().program_count(), 0);
    fs::remove_file(src).unwrap();
}

#[test]
fn cancelled_write_stops_at_a_chunk_boundary() {
    let mut flashing = sim();
    let image = pattern(10 * DATA_CHUNK_SIZE);
    let src = temp_path("cancel-write.bin");
    fs::write(&src, &image).unwrap();

    let token = CancelToken::new();
    let mut reporter = CancelAfter {
        token: token.clone(),
        after: 3,
        seen: 0,
    };
    let err = flashing.write_rom(&src, 0, &mut reporter, &token).unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert_eq!(err.code(), -7);

    let rom = flashing.transport().cart().rom_image(image.len());
    assert_eq!(rom[..3 * DATA_CHUNK_SIZE], image[..3 * DATA_CHUNK_SIZE]);
    assert!(rom[3 * DATA_CHUNK_SIZE..].iter().all(|&b| b == 0xff));
    fs::remove_file(src).unwrap();
}

#[test]
fn cancelled_dump_keeps_what_was_received() {
    let mut flashing = sim();
    flashing.transport_mut().cart_mut().load_rom(&pattern(8 * DATA_CHUNK_SIZE));

    let token = CancelToken::new();
    let mut reporter = CancelAfter {
        token: token.clone(),
        after: 5,
        seen: 0,
    };
    let path = temp_path("cancel-read.bin");
    let err = flashing
        .read_rom(&path, 512, true, &mut reporter, &token)
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert_eq!(fs::read(&path).unwrap(), pattern(5 * DATA_CHUNK_SIZE));
    fs::remove_file(path).unwrap();
}

#[test]
fn short_final_chunk_is_padded_to_size() {
    let total = 512 * 1024;
    let limit = total - DATA_CHUNK_SIZE + 300;
    let mut flashing = session(SimTransport::new(SimConfig::default()).stream_limit(limit as u64));
    let rom = pattern(total);
    flashing.transport_mut().cart_mut().load_rom(&rom);

    let path = temp_path("short.bin");
    let mut reporter = RecordingReporter::default();
    let len = flashing
        .read_rom(&path, 512, true, &mut reporter, &CancelToken::new())
        .unwrap();

    assert_eq!(len, total as u64);
    let dumped = fs::read(&path).unwrap();
    assert_eq!(dumped.len(), total);
    assert_eq!(dumped[..limit], rom[..limit]);
    assert!(dumped[limit..].iter().all(|&b| b == 0xff));
    assert!(
        reporter
            .lines()
            .contains(&"File size preserved at exactly 512 KB (no trimming)")
    );
    fs::remove_file(path).unwrap();
}

#[test]
fn dump_over_a_byte_stream_stays_aligned() {
    let total = 512 * 1024;
    let tap = Tap::new(SimTransport::new(SimConfig::default())).byte_stream();
    let mut flashing = Flashing::new(tap).with_timing(Timing::immediate());
    let rom = pattern(total);
    flashing.transport_mut().inner.cart_mut().load_rom(&rom);

    let path = temp_path("stream.bin");
    let len = flashing
        .read_rom(&path, 512, true, &mut NullReporter, &CancelToken::new())
        .unwrap();

    assert_eq!(len, total as u64);
    assert_eq!(fs::read(&path).unwrap(), rom);
    fs::remove_file(path).unwrap();
}

#[test]
fn write_over_a_byte_stream() {
    let tap = Tap::new(SimTransport::new(SimConfig::default())).byte_stream();
    let mut flashing = Flashing::new(tap).with_timing(Timing::immediate());
    let image = pattern(5 * DATA_CHUNK_SIZE + 10);
    let src = temp_path("stream-write.bin");
    fs::write(&src, &image).unwrap();

    let written = flashing
        .write_rom(&src, 0, &mut NullReporter, &CancelToken::new())
        .unwrap();
    assert_eq!(written, image.len() as u64);
    assert_eq!(flashing.transport().inner.cart().rom_image(image.len()), image);
    fs::remove_file(src).unwrap();
}

#[test]
fn missing_final_chunk_still_completes() {
    let total = 512 * 1024;
    let limit = total - DATA_CHUNK_SIZE;
    let mut flashing = session(SimTransport::new(SimConfig::default()).stream_limit(limit as u64));
    let rom = pattern(total);
    flashing.transport_mut().cart_mut().load_rom(&rom);

    let path = temp_path("missing.bin");
    let len = flashing
        .read_rom(&path, 512, true, &mut NullReporter, &CancelToken::new())
        .unwrap();

    assert_eq!(len, total as u64);
    let dumped = fs::read(&path).unwrap();
    assert_eq!(dumped[..limit], rom[..limit]);
    assert!(dumped[limit..].iter().all(|&b| b == 0xff));
    fs::remove_file(path).unwrap();
}

#[test]
fn sram_round_trip() {
    let mut flashing = sim();
    let save = pattern(2000);
    let src = temp_path("save.srm");
    fs::write(&src, &save).unwrap();

    let mut reporter = RecordingReporter::default();
    let written = flashing
        .write_sram(&src, &mut reporter, &CancelToken::new())
        .unwrap();
    assert_eq!(written, 2000);
    let sram = flashing.transport().cart().sram();
    assert_eq!(sram[..2000], save[..]);
    assert!(sram[2000..2048].iter().all(|&b| b == 0));

    let dst = temp_path("save-back.srm");
    let read = flashing
        .read_sram(&dst, &mut reporter, &CancelToken::new())
        .unwrap();
    assert_eq!(read, SRAM_SIZE as u64);
    let dumped = fs::read(&dst).unwrap();
    assert_eq!(dumped.len(), SRAM_SIZE);
    assert_eq!(dumped[..2000], save[..]);

    fs::remove_file(src).unwrap();
    fs::remove_file(dst).unwrap();
}

#[test]
fn oversized_save_is_truncated() {
    let mut flashing = sim();
    let src = temp_path("big.srm");
    fs::write(&src, pattern(SRAM_SIZE + 5000)).unwrap();

    let mut reporter = RecordingReporter::default();
    let written = flashing
        .write_sram(&src, &mut reporter, &CancelToken::new())
        .unwrap();
    assert_eq!(written, SRAM_SIZE as u64);
    assert!(reporter.lines().contains(&"Warning: File truncated to 32K"));
    assert_eq!(flashing.transport().cart().sram(), &pattern(SRAM_SIZE)[..]);
    fs::remove_file(src).unwrap();
}

#[test]
fn full_erase_clears_flash_and_sram() {
    let mut flashing = sim();
    flashing.transport_mut().cart_mut().load_rom(&[0u8; 4096]);
    flashing.transport_mut().cart_mut().sram_mut().fill(0x55);

    let mut reporter = RecordingReporter::default();
    flashing.erase(0, &mut reporter).unwrap();

    let cart = flashing.transport().cart();
    assert!(cart.rom_image(4096).iter().all(|&b| b == 0xff));
    assert!(cart.sram().iter().all(|&b| b == 0));
    assert!(reporter.lines().contains(&"SRAM ERASE FINISH!!!"));
    assert!(reporter.lines().contains(&"Full chip erase complete"));
}

#[test]
fn sized_erase_covers_the_first_sectors() {
    let mut flashing = sim();
    // 1M of programmed data, only the first 512K gets erased
    flashing.transport_mut().cart_mut().load_rom(&vec![0u8; 1024 * 1024]);

    let mut reporter = RecordingReporter::default();
    flashing.erase(300, &mut reporter).unwrap();

    let rom = flashing.transport().cart().rom_image(1024 * 1024);
    assert!(rom[..512 * 1024].iter().all(|&b| b == 0xff));
    assert!(rom[512 * 1024..].iter().all(|&b| b == 0));
    assert!(reporter.lines().iter().any(|l| l.contains("ERASE OK!")));
}

#[test]
fn erase_error_bit_is_retried() {
    let mut flashing = sim();
    flashing.transport_mut().cart_mut().load_rom(&[0u8; 4096]);
    flashing.transport_mut().cart_mut().fail_next_erases(2);

    flashing.erase(512, &mut NullReporter).unwrap();
    assert!(
        flashing.transport().cart().rom_image(4096)
            .iter()
            .all(|&b| b == 0xff)
    );
}

#[test]
fn stuck_erase_times_out() {
    let cart = SimulatedCart::new(SimConfig {
        sector_busy_reads: 1000,
        ..SimConfig::default()
    });
    let limits = EraseLimits {
        sector_polls: Some(10),
        chip_cycles: Some(2),
    };
    let dispatcher = Dispatcher::new(cart).with_limits(limits);
    let mut flashing = session(SimTransport::with_dispatcher(dispatcher));

    let mut reporter = RecordingReporter::default();
    let err = flashing.erase(512, &mut reporter).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(
        reporter.errors().last().map(|e| e.starts_with("Erase failed")),
        Some(true)
    );
}

#[test]
fn silent_full_erase_times_out() {
    let tap = Tap::new(SimTransport::new(SimConfig::default())).mute_after(0x0e);
    let mut flashing = Flashing::new(tap).with_timing(Timing::immediate());

    let mut reporter = RecordingReporter::default();
    let err = flashing.erase(0, &mut reporter).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(err.code(), -4);
    assert_eq!(flashing.transport().sent.last().map(|f| f[0]), Some(0x0e));
    assert_eq!(
        reporter.errors().last().map(|e| e.starts_with("Erase failed")),
        Some(true)
    );
}

#[test]
fn sector_erase_leaves_neighbours() {
    let mut flashing = sim();
    flashing.transport_mut().cart_mut().load_rom(&vec![0u8; 0x20000]);

    // second small sector, 0x1000 words
    flashing
        .erase_sector(0x1000, &mut RecordingReporter::default())
        .unwrap();
    let cart = flashing.transport().cart();
    assert_eq!(cart.rom_word(0x0fff), 0);
    assert_eq!(cart.rom_word(0x1000), 0xffff);
    assert_eq!(cart.rom_word(0x1fff), 0xffff);
    assert_eq!(cart.rom_word(0x2000), 0);
}

#[test]
fn sector_address_beyond_bus_is_rejected() {
    let mut flashing = sim();
    let err = flashing
        .erase_sector(0x0100_0000, &mut RecordingReporter::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)));
    assert_eq!(err.code(), -8);
}
