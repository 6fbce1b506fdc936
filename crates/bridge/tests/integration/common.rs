use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use embed_bridge::Package;
use tempfile::TempDir;

/// Echoes every inbound message to `outbound` after tagging it with an
/// `EmbeddedContext` header and a per-instance `sequence` digit.
pub const ECHO: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (import "bridge" "header_set" (func $header_set (param i32 i32 i32 i32 i32) (result i32)))
  (import "bridge" "emit" (func $emit (param i32 i32 i32 i64) (result i32)))
  (import "bridge" "log" (func $log (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "inbound")
  (data (i32.const 16) "outbound")
  (data (i32.const 32) "EmbeddedContext")
  (data (i32.const 48) "Yes it works")
  (data (i32.const 64) "sequence")
  (data (i32.const 80) "0123456789")
  (data (i32.const 96) "ready")
  (global $count (mut i32) (i32.const 0))
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 7) (i32.const 0)))
    (drop (call $declare (i32.const 16) (i32.const 8) (i32.const 1)))
    (call $log (i32.const 2) (i32.const 96) (i32.const 5)))
  (func (export "on_message") (param $h i32) (result i32)
    (global.set $count (i32.add (global.get $count) (i32.const 1)))
    (drop (call $header_set (local.get $h)
      (i32.const 32) (i32.const 15) (i32.const 48) (i32.const 12)))
    (drop (call $header_set (local.get $h)
      (i32.const 64) (i32.const 8)
      (i32.add (i32.const 80) (i32.rem_u (global.get $count) (i32.const 10))) (i32.const 1)))
    (call $emit (local.get $h) (i32.const 16) (i32.const 8) (i64.const 100))))
"#;

/// Publishes no channels.
pub const HEADLESS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "main")))
"#;

/// Accepts non-empty messages, declines empty ones, never answers.
pub const SINK: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (import "bridge" "message_len" (func $len (param i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "inbound")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 7) (i32.const 0))))
  (func (export "on_message") (param $h i32) (result i32)
    (i32.eqz (call $len (local.get $h)))))
"#;

/// Emits two text messages while booting.
pub const SOURCE: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (import "bridge" "message_new" (func $new (param i32 i32 i32) (result i32)))
  (import "bridge" "emit" (func $emit (param i32 i32 i32 i64) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "outbound")
  (data (i32.const 16) "one")
  (data (i32.const 32) "two")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 8) (i32.const 1)))
    (drop (call $emit (call $new (i32.const 1) (i32.const 16) (i32.const 3))
      (i32.const 0) (i32.const 8) (i64.const 0)))
    (drop (call $emit (call $new (i32.const 1) (i32.const 32) (i32.const 3))
      (i32.const 0) (i32.const 8) (i64.const 0)))))
"#;

/// Emits a payload of a kind the host does not understand.
pub const OPAQUE: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (import "bridge" "message_new" (func $new (param i32 i32 i32) (result i32)))
  (import "bridge" "emit" (func $emit (param i32 i32 i32 i64) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "outbound")
  (data (i32.const 16) "{}")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 8) (i32.const 1)))
    (drop (call $emit (call $new (i32.const 7) (i32.const 16) (i32.const 2))
      (i32.const 0) (i32.const 8) (i64.const 0)))))
"#;

/// Traps in its entry point.
pub const TRAPPING_START: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "main") unreachable))
"#;

/// Publishes `inbound` as a queue instead of a direct channel.
pub const WRONG_KIND: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "inbound")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 7) (i32.const 1)))))
"#;

/// Publishes `inbound` without exporting a handler.
pub const MISSING_HANDLER: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "inbound")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 7) (i32.const 0)))))
"#;

/// Its shutdown export traps.
pub const FAILING_STOP: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "main"))
  (func (export "stop") unreachable))
"#;

/// Spins forever in its message handler.
pub const SPINNING_HANDLER: &str = r#"
(module
  (import "bridge" "channel_declare" (func $declare (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "inbound")
  (func (export "main")
    (drop (call $declare (i32.const 0) (i32.const 7) (i32.const 0))))
  (func (export "on_message") (param i32) (result i32)
    (loop $spin (br $spin))
    (i32.const 0)))
"#;

/// Grows its memory by 100 pages while booting and traps if that fails.
pub const HUNGRY: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "main")
    (if (i32.eq (memory.grow (i32.const 100)) (i32.const -1))
      (then unreachable))))
"#;

pub struct Fixture {
    pub dir: TempDir,
    pub package: Package,
}

pub fn fixture(wat: &str) -> Result<Fixture> {
    let dir = tempfile::tempdir().context("failed to create fixture directory")?;
    let path = dir.path().join("app.wasm");
    std::fs::write(&path, wat).context("failed to write fixture")?;
    let package = Package::resolve(&path).context("failed to resolve fixture")?;
    Ok(Fixture { dir, package })
}

pub fn elapsed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}
