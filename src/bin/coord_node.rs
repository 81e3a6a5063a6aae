// Standalone coordination-engine demo node.
//
// Boots one `Participant` against the in-memory reference `Storage`/
// `Transport` and drives it from simple line commands on stdin. Multiple
// copies of this binary sharing state isn't possible with the in-memory
// backend — this is a local exerciser, not a deployable server; a real
// deployment plugs in a `Storage`/`Transport` pair backed by an actual
// store and network.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use coord_engine::mem::{MemNetwork, MemStorage};
use coord_engine::{EngineConfig, Error, Participant, Path, Result};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    coord_engine::telemetry::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("coord-engine.toml"));
    let config = EngineConfig::load_or_default(&config_path)?;

    let storage = Arc::new(MemStorage::new());
    let network = MemNetwork::new();
    let participant = Participant::bootstrap(
        storage,
        Arc::new(network.transport(b"coord-node-cli".to_vec())),
        config,
    )
    .await?;

    println!("coord-node session: {}", participant.session_id());
    println!("commands: create <path> <value> [ephemeral] | get <path> | set <path> <value> | delete <path> [recursive] | children <path> | quit");

    let cancel = CancellationToken::new();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| Error::Internal(e.to_string()))?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] => break,
            ["create", path, value] => {
                run(participant.create(&parse_path(path)?, value.as_bytes().to_vec(), false, &cancel).await)
            }
            ["create", path, value, "ephemeral"] => {
                run(participant.create(&parse_path(path)?, value.as_bytes().to_vec(), true, &cancel).await)
            }
            ["get", path] => match participant.get(&parse_path(path)?, &cancel).await {
                Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                Err(err) => eprintln!("error: {err}"),
            },
            ["set", path, value] => {
                run(participant.set_value(&parse_path(path)?, value.as_bytes().to_vec(), &cancel).await)
            }
            ["delete", path] => run(participant.delete(&parse_path(path)?, false, &cancel).await),
            ["delete", path, "recursive"] => {
                run(participant.delete(&parse_path(path)?, true, &cancel).await)
            }
            ["children", path] => match participant.children(&parse_path(path)?, &cancel).await {
                Ok(children) => println!("{}", children.join(", ")),
                Err(err) => eprintln!("error: {err}"),
            },
            _ => eprintln!("unrecognized command: {line}"),
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    participant.shutdown().await
}

fn parse_path(raw: &str) -> Result<Path> {
    raw.parse()
        .map_err(|e| Error::Internal(format!("invalid path {raw}: {e}")))
}

fn run<T>(result: std::result::Result<T, Error>) {
    if let Err(err) = result {
        eprintln!("error: {err}");
    }
}
