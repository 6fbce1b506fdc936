use std::{
    env::args,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use embed_bridge::{
    BridgeConfig, BridgeProcessor, FlowRecord, MemorySession, Relationship, Trigger,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{self, error::TryRecvError},
};
use tracing::{info, warn};

mod trace;

const IDLE_BACKOFF: Duration = Duration::from_millis(10);
const YIELD_BACKOFF: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    trace::init_tracing()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let task = args().nth(1);
    let config = args().nth(2).map(PathBuf::from);
    match (task.as_deref(), config) {
        (Some("validate"), Some(path)) => validate(&path),
        (Some("run"), Some(path)) => run(&path).await,
        (Some("validate" | "run"), None) => Err(anyhow!("missing configuration file")),
        _ => Err(anyhow!(
            "unknown task, expected `validate <config.yaml>` or `run <config.yaml>`"
        )),
    }
}

fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
    BridgeConfig::from_yaml_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    match config.validate() {
        Ok(package) => {
            println!(
                "entry '{}' is resolvable against package '{}'",
                config.entry,
                package.path().display()
            );
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!(
            "entry '{}' is NOT resolvable against package '{}'",
            config.entry,
            config.package.display()
        ))),
    }
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let (tx, rx) = mpsc::channel::<String>(64);
    let worker = tokio::task::spawn_blocking(move || drive(&config, rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if tx.send(line).await.is_err() {
            break;
        }
    }
    drop(tx);

    worker.await.context("processor task panicked")?
}

/// Schedule the processor and trigger it until stdin is exhausted and the
/// application has nothing more to hand back.
fn drive(config: &BridgeConfig, mut lines: mpsc::Receiver<String>) -> anyhow::Result<()> {
    let mut processor = BridgeProcessor::new();
    processor
        .on_scheduled(config)
        .context("failed to schedule processor")?;
    info!(entry = %config.entry, "processor scheduled");

    let mut session = MemorySession::new();
    let result = pump(&mut processor, &mut session, &mut lines);
    processor.on_stopped();
    result
}

fn pump(
    processor: &mut BridgeProcessor,
    session: &mut MemorySession,
    lines: &mut mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let mut input_closed = false;
    loop {
        match lines.try_recv() {
            Ok(line) => session.enqueue(FlowRecord::new(line)),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => input_closed = true,
        }

        let had_input = session.pending() > 0;
        let outcome = processor.on_trigger(session)?;
        let routed = session.take_transferred();
        let produced = !routed.is_empty();
        for (relationship, record) in routed {
            emit(relationship, &record)?;
        }

        if input_closed && !had_input && !produced {
            return Ok(());
        }
        match outcome {
            Trigger::Yield => std::thread::sleep(YIELD_BACKOFF),
            Trigger::Continue if !had_input && !produced => std::thread::sleep(IDLE_BACKOFF),
            Trigger::Continue => {}
        }
    }
}

fn emit(relationship: Relationship, record: &FlowRecord) -> anyhow::Result<()> {
    match relationship {
        Relationship::Success => {
            let line = serde_json::json!({
                "content": String::from_utf8_lossy(&record.content),
                "attributes": record.attributes,
            });
            println!("{}", serde_json::to_string(&line)?);
        }
        Relationship::Failure => warn!(
            content = %String::from_utf8_lossy(&record.content),
            penalized = record.penalized,
            "record routed to failure"
        ),
    }
    Ok(())
}
