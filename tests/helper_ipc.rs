//! End-to-end tests of the helper/client IPC: handshake, command dispatch,
//! progress frames, timeouts, and disconnect behavior, all over the local
//! socket transport.
#![cfg(unix)]

use std::io::{Read as _, Write as _};
use std::time::{Duration, Instant};

use anyhow::Result;
use rpi_imager_helper::client::{ClientState, HelperClient};
use rpi_imager_helper::elevation::{HelperLauncher, HelperProcess};
use rpi_imager_helper::helper::{HelperService, HelperState, ServiceStep};
use rpi_imager_helper::protocol::{
    encode_text, Frame, FrameReader, ProgressKind, TOKEN_FAILURE, TOKEN_HELLO, TOKEN_READY,
};
use rpi_imager_helper::transport::{self, Stream};
use sha2::{Digest, Sha256};

fn unique_socket(tag: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("rpii-test-{tag}-{}-{nanos:x}", std::process::id())
}

/// Launcher for tests where the helper already runs in-process.
struct NullLauncher;

impl HelperLauncher for NullLauncher {
    fn launch(&self, _args: &[String]) -> Result<Box<dyn HelperProcess>> {
        Ok(Box::new(NullProcess))
    }
}

struct NullProcess;

impl HelperProcess for NullProcess {
    fn poll_exit(&mut self) -> Result<Option<i32>> {
        Ok(None)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Raw peer talking frames over a transport stream.
struct RawPeer {
    stream: Box<dyn Stream>,
    reader: FrameReader,
}

impl RawPeer {
    fn connect(name: &str) -> Self {
        Self {
            stream: transport::connect(name).expect("connect"),
            reader: FrameReader::new(),
        }
    }

    fn read_bytes(&mut self, len: usize, deadline: Duration) -> Vec<u8> {
        let end = Instant::now() + deadline;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while out.len() < len {
            assert!(Instant::now() < end, "timed out reading {len} bytes");
            let n = self.stream.poll_read(&mut buf).expect("poll_read");
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn next_frame(&mut self, deadline: Duration) -> Frame {
        let end = Instant::now() + deadline;
        loop {
            if let Some(frame) = self.reader.next_frame().expect("decode") {
                return frame;
            }
            assert!(Instant::now() < end, "timed out waiting for a frame");
            let mut buf = [0u8; 4096];
            let n = self.stream.poll_read(&mut buf).expect("poll_read");
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
            } else {
                self.reader.extend(&buf[..n]);
            }
        }
    }

    fn send_text(&mut self, text: &str) {
        self.stream.write_all(&encode_text(text)).expect("write");
        self.stream.flush().expect("flush");
    }

    /// Non-blocking frame probe, for tests that pump the service themselves.
    fn try_frame(&mut self) -> Option<Frame> {
        if let Some(frame) = self.reader.next_frame().expect("decode") {
            return Some(frame);
        }
        let mut buf = [0u8; 4096];
        if let Ok(n) = self.stream.poll_read(&mut buf) {
            if n > 0 {
                self.reader.extend(&buf[..n]);
            }
        }
        self.reader.next_frame().expect("decode")
    }
}

/// Drive the service until `predicate` holds (or panic after the deadline).
fn pump_until(
    service: &mut HelperService,
    deadline: Duration,
    mut predicate: impl FnMut(&HelperService) -> bool,
) {
    let end = Instant::now() + deadline;
    while !predicate(service) {
        assert!(Instant::now() < end, "service never reached expected state");
        assert_eq!(service.poll_once(), ServiceStep::Continue);
    }
}

#[test]
fn handshake_sends_18_byte_hello_and_reaches_ready() {
    let name = unique_socket("handshake");
    let mut service = HelperService::bind(&name, false).unwrap();
    let mut peer = RawPeer::connect(&name);

    // Accept + HELLO.
    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::HandshakeReceiving
    });

    // The HELLO string frame is exactly 18 bytes on the wire.
    let hello = peer.read_bytes(18, Duration::from_secs(2));
    assert_eq!(hello, encode_text(TOKEN_HELLO));

    peer.send_text(TOKEN_READY);
    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::Ready
    });
    assert!(service.current_command().is_none());
}

#[test]
fn unknown_command_gets_failure_and_returns_to_ready() {
    let name = unique_socket("unknown");
    let mut service = HelperService::bind(&name, false).unwrap();
    let mut peer = RawPeer::connect(&name);

    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::HandshakeReceiving
    });
    assert_eq!(
        peer.next_frame(Duration::from_secs(2)),
        Frame::Text(TOKEN_HELLO.into())
    );
    peer.send_text(TOKEN_READY);
    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::Ready
    });

    peer.send_text("NOPE");
    let end = Instant::now() + Duration::from_secs(5);
    let reply = loop {
        assert!(Instant::now() < end, "no reply to the unknown command");
        assert_eq!(service.poll_once(), ServiceStep::Continue);
        if let Some(frame) = peer.try_frame() {
            break frame;
        }
    };
    assert_eq!(reply, Frame::Text(TOKEN_FAILURE.into()));
    assert_eq!(service.state(), HelperState::Ready);
    assert!(service.current_command().is_none());
}

#[test]
fn bad_handshake_token_enters_error_within_one_receive() {
    let name = unique_socket("badtoken");
    let mut service = HelperService::bind(&name, false).unwrap();
    let mut peer = RawPeer::connect(&name);

    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::HandshakeReceiving
    });
    let _ = peer.next_frame(Duration::from_secs(2));

    peer.send_text("BOGUS");
    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::Error
    });

    // The next step resets a non-daemon service back to Idle.
    assert_eq!(service.poll_once(), ServiceStep::Continue);
    assert_eq!(service.state(), HelperState::Idle);
}

#[test]
fn daemon_exits_when_client_disconnects() {
    let name = unique_socket("disconnect");
    let mut service = HelperService::bind(&name, true).unwrap();
    let mut peer = RawPeer::connect(&name);

    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::HandshakeReceiving
    });
    let _ = peer.next_frame(Duration::from_secs(2));
    peer.send_text(TOKEN_READY);
    pump_until(&mut service, Duration::from_secs(5), |s| {
        s.state() == HelperState::Ready
    });

    drop(peer);

    let end = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < end, "daemon never exited");
        match service.poll_once() {
            ServiceStep::Continue => {}
            ServiceStep::Exit(code) => {
                assert_eq!(code, 0);
                break;
            }
        }
    }
}

fn pseudorandom(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn full_stack_write_verify_roundtrip() {
    let name = unique_socket("fullstack");
    let mut service = HelperService::bind(&name, true).unwrap();
    let worker = std::thread::spawn(move || service.run().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("image.img");
    let device_path = dir.path().join("device.img");

    let image = pseudorandom(2 * 1024 * 1024, 0xA5A5);
    std::fs::write(&source_path, &image).unwrap();
    std::fs::write(&device_path, vec![0u8; image.len()]).unwrap();

    let mut client = HelperClient::new(Box::new(NullLauncher), &name);
    client.ensure_running().unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    // WRITE succeeds, progress frames are typed Write with a fixed total.
    let mut frames = Vec::new();
    let ok = client
        .run_write_to_drive(
            device_path.to_str().unwrap(),
            source_path.to_str().unwrap(),
            &mut |kind, now, total| frames.push((kind, now, total)),
        )
        .unwrap();
    assert!(ok, "WRITE should report SUCCESS");
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|&(kind, _, _)| kind == ProgressKind::Write));
    assert!(frames
        .iter()
        .all(|&(_, _, total)| total == image.len() as i64));

    // Device contents equal the source.
    assert_eq!(std::fs::read(&device_path).unwrap(), image);

    // VERIFY against the client's own hash of the image.
    let hex = format!("{:x}", Sha256::digest(&image));
    let ok = client
        .run_verify(
            device_path.to_str().unwrap(),
            source_path.to_str().unwrap(),
            Some(&hex),
            &mut |_, _, _| {},
        )
        .unwrap();
    assert!(ok, "VERIFY should pass on intact contents");

    // VERIFY with no hash argument falls back to the retained write hash.
    let ok = client
        .run_verify(
            device_path.to_str().unwrap(),
            source_path.to_str().unwrap(),
            None,
            &mut |_, _, _| {},
        )
        .unwrap();
    assert!(ok);

    // Corrupt one byte on the device; VERIFY now fails.
    {
        use std::fs::OpenOptions;
        use std::io::{Seek, SeekFrom};
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .unwrap();
        f.seek(SeekFrom::Start(1_048_576)).unwrap();
        let mut byte = [0u8; 1];
        f.read_exact(&mut byte).unwrap();
        byte[0] ^= 0x01;
        f.seek(SeekFrom::Start(1_048_576)).unwrap();
        f.write_all(&byte).unwrap();
    }
    let ok = client
        .run_verify(
            device_path.to_str().unwrap(),
            source_path.to_str().unwrap(),
            Some(&hex),
            &mut |_, _, _| {},
        )
        .unwrap();
    assert!(!ok, "VERIFY must fail after corruption");

    client.shutdown();
    assert_eq!(worker.join().unwrap(), 0);
}

/// A minimal FAT16 volume image: 512-byte sectors, one sector per cluster,
/// two FAT copies, a fixed root directory.
fn mkfat16_image() -> Vec<u8> {
    let bytes_per_sector = 512u16;
    let reserved = 1u16;
    let num_fats = 2u8;
    let sectors_per_fat = 32u16;
    let root_entries = 512u16;
    let total_sectors = 8192u16;

    let mut img = vec![0u8; total_sectors as usize * bytes_per_sector as usize];
    img[0] = 0xEB;
    img[2] = 0x90;
    img[11..13].copy_from_slice(&bytes_per_sector.to_le_bytes());
    img[13] = 1;
    img[14..16].copy_from_slice(&reserved.to_le_bytes());
    img[16] = num_fats;
    img[17..19].copy_from_slice(&root_entries.to_le_bytes());
    img[19..21].copy_from_slice(&total_sectors.to_le_bytes());
    img[22..24].copy_from_slice(&sectors_per_fat.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xAA;

    for copy in 0..num_fats as usize {
        let base =
            (reserved as usize + copy * sectors_per_fat as usize) * bytes_per_sector as usize;
        img[base..base + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
        img[base + 2..base + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
    }
    img
}

#[test]
fn customize_edits_boot_files_through_the_dispatcher() {
    use rpi_imager_helper::customize::Customization;
    use rpi_imager_helper::fat::FatVolume;

    let name = unique_socket("customize");
    let mut service = HelperService::bind(&name, true).unwrap();
    let worker = std::thread::spawn(move || service.run().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let device_path = dir.path().join("boot.img");
    std::fs::write(&device_path, mkfat16_image()).unwrap();

    let mut client = HelperClient::new(Box::new(NullLauncher), &name);
    client.ensure_running().unwrap();

    let custom = Customization {
        config: "arm_64bit=1\n".into(),
        cloudinit_user_data: "hostname: testpi\n".into(),
        init_format: "cloudinit".into(),
        ..Default::default()
    };
    let ok = client
        .run_customize(device_path.to_str().unwrap(), &custom)
        .unwrap();
    assert!(ok, "CUSTOMIZE should report SUCCESS");

    // Inspect the image the way the customizer wrote it.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .unwrap();
    let mut vol = FatVolume::open_boot_partition(file).unwrap();
    assert_eq!(vol.read_file("config.txt").unwrap(), b"arm_64bit=1\n");
    assert_eq!(
        vol.read_file("user-data").unwrap(),
        b"#cloud-config\nhostname: testpi\n"
    );

    // FORMAT has no Windows tooling here and must fail cleanly.
    let ok = client.run_format_drive("E:").unwrap();
    assert!(!ok, "FORMAT should report FAILURE off-Windows");

    client.shutdown();
    assert_eq!(worker.join().unwrap(), 0);
}

#[test]
fn client_times_out_against_a_silent_helper() {
    let name = unique_socket("timeout");
    let mut listener = transport::bind(&name).unwrap();

    // A fake helper that handshakes, then swallows the command.
    let silent = std::thread::spawn(move || {
        let mut stream = loop {
            if let Some(s) = listener.accept().unwrap() {
                break s;
            }
            std::thread::sleep(Duration::from_millis(2));
        };
        stream.write_all(&encode_text(TOKEN_HELLO)).unwrap();
        stream.flush().unwrap();

        let mut reader = FrameReader::new();
        let mut seen = 0;
        let end = Instant::now() + Duration::from_secs(10);
        // Frame 1: READY. Frame 2: the command we never answer.
        while seen < 2 && Instant::now() < end {
            let mut buf = [0u8; 4096];
            match stream.poll_read(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(2)),
                Ok(n) => {
                    reader.extend(&buf[..n]);
                    while reader.next_frame().unwrap().is_some() {
                        seen += 1;
                    }
                }
                Err(_) => break,
            }
        }
        // Keep the connection open long enough for the client to time out.
        std::thread::sleep(Duration::from_secs(2));
    });

    let mut client = HelperClient::new(Box::new(NullLauncher), &name);
    client.operation_timeout = Duration::from_secs(1);
    client.ensure_running().unwrap();

    let start = Instant::now();
    let err = client
        .submit(r#"WRITE "nowhere" "nothing""#, &mut |_, _, _| {})
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_secs(1),
        "returned before the timeout: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(1500),
        "took too long to time out: {elapsed:?}"
    );
    assert!(err.to_string().contains("timed out"), "got: {err:#}");
    assert_eq!(client.state(), ClientState::Error);

    silent.join().unwrap();
}
