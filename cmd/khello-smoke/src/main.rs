//! khello End-to-End Smoke Test
//!
//! Drives one device the way its user clients would:
//!   Part A: Buffer: write/read, truncation, transfer faults
//!   Part B: Poll: readiness bits before and after writes
//!   Part C: Mmap: size limits, zero-copy aliasing, independence from the buffer
//!   Part D: Concurrency: competing writers never interleave
//!   Part E: Teardown: shutdown refused while mapped, clean afterwards
//!
//! Run: ./target/release/khello-smoke
//! (KHELLO_LOG_LEVEL=info shows the device's own log lines)

use std::sync::Arc;
use std::thread;

use khello_core::kprint::{self, LogLevel};
use khello_core::{system_page_size, FileOperations, KhelloError, PollMask, SessionState};
use khello_module::{DeviceBuilder, DeviceFacade, TracingVmOps};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Buffer
// ════════════════════════════════════════════════════════════

fn test_buffer(t: &mut TestRunner, dev: &DeviceFacade) {
    t.section("Part A: Buffer (read/write)");
    let h = dev.open();

    // A1: write "hello"
    match dev.write(&h, &b"hello"[..], 5) {
        Ok(n) => t.check("write \"hello\"", n == 5, &format!("stored {} bytes", n)),
        Err(e) => t.fail("write \"hello\"", &e.to_string()),
    }

    // A2: read it back
    let mut out = [0u8; 32];
    match dev.read(&h, &mut out[..], 32) {
        Ok(n) => t.check(
            "read returns \"hello\"",
            n == 5 && &out[..5] == b"hello",
            &format!("got {} bytes: {:?}", n, String::from_utf8_lossy(&out[..n])),
        ),
        Err(e) => t.fail("read returns \"hello\"", &e.to_string()),
    }

    // A3: 40-byte write truncates to 31, null-terminated
    let long: Vec<u8> = (0..40u8).map(|i| b'a' + (i % 26)).collect();
    match dev.write(&h, &long, long.len()) {
        Ok(n) => {
            let snap = dev.buffer().snapshot();
            t.check(
                "40-byte write stores 31 + NUL",
                n == 31 && snap.as_bytes() == &long[..31] && snap.raw()[31] == 0,
                &format!("stored {} bytes", n),
            );
        }
        Err(e) => t.fail("40-byte write stores 31 + NUL", &e.to_string()),
    }

    // A4: read ignores requested length
    let mut out = vec![0u8; 32];
    match dev.read(&h, &mut out, 4) {
        Ok(n) => t.check("read returns stored length", n == 31, &format!("got {}", n)),
        Err(e) => t.fail("read returns stored length", &e.to_string()),
    }

    // A5: destination too small
    let mut tiny = [0u8; 8];
    match dev.read(&h, &mut tiny[..], 8) {
        Err(KhelloError::TransferFault { copied, missing }) => t.check(
            "short destination -> TransferFault",
            copied == 8 && missing == 23,
            &format!("copied {} missing {}", copied, missing),
        ),
        other => t.fail("short destination -> TransferFault", &format!("{:?}", other)),
    }

    dev.release(h);
}

// ════════════════════════════════════════════════════════════
// Part B: Poll
// ════════════════════════════════════════════════════════════

fn test_poll(t: &mut TestRunner, dev: &DeviceFacade) {
    t.section("Part B: Poll (readiness)");
    let h = dev.open();

    // B1: empty write clears readability
    let _ = dev.write(&h, &b""[..], 0);
    let mask = dev.poll(&h);
    t.check("empty buffer: WRITABLE only", mask == PollMask::WRITABLE, &format!("{:?}", mask));

    // B2: both bits after a write
    let _ = dev.write(&h, &b"x"[..], 1);
    let mask = dev.poll(&h);
    t.check(
        "after write: READABLE | WRITABLE",
        mask == PollMask::READABLE | PollMask::WRITABLE,
        &format!("{:?}", mask),
    );
    t.check(
        "bits match POLLIN | POLLOUT",
        mask.bits() == (libc::POLLIN | libc::POLLOUT) as u32,
        &format!("{:#x}", mask.bits()),
    );

    dev.release(h);
}

// ════════════════════════════════════════════════════════════
// Part C: Mmap
// ════════════════════════════════════════════════════════════

fn test_mmap(t: &mut TestRunner, dev: &DeviceFacade) {
    t.section("Part C: Mmap (zero-copy page)");
    let h = dev.open();
    let ps = system_page_size();
    println!("       Pagesize: {}", ps);

    // C1: one page accepted
    match dev.mmap(&h, ps, None) {
        Ok(s) => t.check("map one page", s.state() == SessionState::Open, "session not open"),
        Err(e) => t.fail("map one page", &e.to_string()),
    }

    // C2: one page + 1 rejected
    match dev.mmap(&h, ps + 1, None) {
        Err(KhelloError::SizeExceeded { .. }) => t.pass("map page + 1 -> SizeExceeded"),
        other => t.fail("map page + 1 -> SizeExceeded", &format!("{:?}", other.map(|s| s.len()))),
    }

    // C3: two pages rejected
    match dev.mmap(&h, 2 * ps, None) {
        Err(e) => t.check("map two pages rejected", e.errno() == -libc::EINVAL, &e.to_string()),
        Ok(_) => t.fail("map two pages rejected", "accepted"),
    }

    // C4: write "haha" through a 32-byte mapping, see it in the device view
    let session = match dev.mmap(&h, 32, None) {
        Ok(s) => s,
        Err(e) => {
            t.fail("map 32 bytes", &e.to_string());
            dev.release(h);
            return;
        }
    };
    let page = match dev.page() {
        Some(p) => Arc::clone(p),
        None => {
            t.fail("device page present", "page already released");
            dev.release(h);
            return;
        }
    };
    let wrote = session.write_at(0, b"haha\0").is_ok();
    let mut view = [0u8; 5];
    let read = page.read_at(0, &mut view).is_ok();
    t.check(
        "mapped write visible without copy",
        wrote && read && &view == b"haha\0",
        &format!("{:?}", view),
    );

    // C5: buffer untouched by the mapping
    let snap = dev.buffer().snapshot();
    t.check("buffer independent of page", snap.as_bytes() == b"x", &format!("{:?}", snap));

    drop(session);
    t.check("session closed on drop", dev.open_sessions() == 0, "session still open");
    dev.release(h);
}

// ════════════════════════════════════════════════════════════
// Part D: Concurrency
// ════════════════════════════════════════════════════════════

fn test_concurrency(t: &mut TestRunner, dev: &Arc<DeviceFacade>) {
    t.section("Part D: Concurrent writers");

    let mut workers = vec![];
    for byte in [b'a', b'b'] {
        let dev = Arc::clone(dev);
        workers.push(thread::spawn(move || {
            let h = dev.open();
            let payload = [byte; 4];
            for _ in 0..10_000 {
                let _ = dev.write(&h, &payload[..], payload.len());
            }
            dev.release(h);
        }));
    }
    let mut joined = true;
    for w in workers {
        joined &= w.join().is_ok();
    }
    t.check("writers joined", joined, "a writer panicked");

    let h = dev.open();
    let mut out = [0u8; 32];
    match dev.read(&h, &mut out[..], 32) {
        Ok(n) => t.check(
            "final content is one whole write",
            n == 4 && (&out[..4] == b"aaaa" || &out[..4] == b"bbbb"),
            &format!("{:?}", String::from_utf8_lossy(&out[..n])),
        ),
        Err(e) => t.fail("final content is one whole write", &e.to_string()),
    }
    dev.release(h);
}

// ════════════════════════════════════════════════════════════
// Part E: Teardown
// ════════════════════════════════════════════════════════════

fn test_teardown(t: &mut TestRunner) {
    t.section("Part E: Teardown");

    let ops = Arc::new(TracingVmOps::new("khello-smoke"));
    let mut dev = match DeviceBuilder::new().name("khello-smoke").vm_ops(ops.clone()).build() {
        Ok(d) => d,
        Err(e) => {
            t.fail("build second device", &e.to_string());
            return;
        }
    };
    let h = dev.open();

    let mut session = match dev.mmap(&h, 64, None) {
        Ok(s) => s,
        Err(e) => {
            t.fail("map before shutdown", &e.to_string());
            return;
        }
    };

    t.check(
        "shutdown refused while mapped",
        dev.shutdown() == Err(KhelloError::PageInUse(1)),
        "shutdown was not refused",
    );

    let closed = session.close().is_ok();
    t.check("session close", closed && session.state() == SessionState::Closed, "close failed");
    t.check("vm hooks balanced", ops.opened() == 1 && ops.closed() == 1, "open/close mismatch");

    dev.release(h);
    match dev.shutdown() {
        Ok(()) => t.check(
            "shutdown after unmap",
            dev.registry().is_empty() && dev.page().is_none(),
            "registration or page leaked",
        ),
        Err(e) => t.fail("shutdown after unmap", &e.to_string()),
    }
}

fn main() {
    println!("=== khello End-to-End Smoke Test ===");
    if std::env::var("KHELLO_LOG_LEVEL").is_err() {
        kprint::set_log_level(LogLevel::Warn);
    }

    let mut t = TestRunner::new();

    let dev = match DeviceBuilder::new().build() {
        Ok(d) => Arc::new(d),
        Err(e) => {
            println!("\nFATAL: DeviceBuilder failed: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };
    println!("    node: {} ({})", dev.node_path(), dev.dev_num());

    test_buffer(&mut t, &dev);
    test_poll(&mut t, &dev);
    test_mmap(&mut t, &dev);
    test_concurrency(&mut t, &dev);
    drop(dev);

    test_teardown(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
