use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tsdb_core::TimeSeries;
use tsdb_server::{Status, TsdbClient};

#[derive(Parser)]
#[command(name = "tsdb", version, about = "Time-series database CLI", long_about = None)]
struct Cli {
    /// Host the server in this process instead of sending an operation
    #[arg(long)]
    serve: bool,

    /// Base directory holding database directories (serve mode)
    #[arg(short, long, default_value = "files")]
    data_dir: PathBuf,

    /// Database name (serve mode)
    #[arg(long, default_value = "default")]
    name: String,

    /// Address to bind when serving
    #[arg(long, default_value = "127.0.0.1:9999")]
    listen: String,

    /// Fixed series length (serve mode)
    #[arg(long)]
    ts_length: Option<usize>,

    /// JSON schema file (serve mode)
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Serve from memory instead of disk
    #[arg(long)]
    memory: bool,

    /// Server to send operations to
    #[arg(long, env = "TSDB_ADDR", default_value = "127.0.0.1:9999")]
    addr: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Filter {
    /// Metadata filter, `field=value` or `field={"<=": 3}`
    #[arg(long = "where")]
    filters: Vec<String>,
    /// Sort field prefixed with `+` or `-`
    #[arg(long, allow_hyphen_values = true)]
    sort_by: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a series, given as `[[times...],[values...]]`
    Insert {
        pk: String,
        #[arg(long)]
        ts: String,
    },
    /// Set metadata fields on an existing key
    Upsert {
        pk: String,
        /// `field=value`, value parsed as JSON when possible
        #[arg(long = "set", required = true)]
        set: Vec<String>,
    },
    /// Delete a key
    Delete { pk: String },
    /// Select keys by metadata
    Select {
        #[command(flatten)]
        filter: Filter,
        /// Fields to return; pass with no values for every field
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        fields: Option<Vec<String>>,
    },
    /// Run a stored procedure over selected rows
    AugmentedSelect {
        proc: String,
        #[arg(long, value_delimiter = ',')]
        target: Option<Vec<String>>,
        /// Procedure argument as JSON
        #[arg(long)]
        arg: Option<String>,
        #[command(flatten)]
        filter: Filter,
    },
    /// Attach a stored procedure to an event
    AddTrigger {
        proc: String,
        onwhat: String,
        #[arg(long, value_delimiter = ',')]
        target: Option<Vec<String>>,
        #[arg(long)]
        arg: Option<String>,
    },
    /// Detach every trigger of a procedure from an event
    RemoveTrigger { proc: String, onwhat: String },
    /// Find the stored series closest to a query series
    FindSimilar {
        #[arg(long)]
        ts: String,
        #[arg(long, value_delimiter = ',')]
        vpkeys: Option<Vec<String>>,
    },
    /// Rebuild the vantage-point tree
    MakeVpTree,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.serve {
        std::env::set_var("TSDB_DATA", cli.data_dir.to_string_lossy().to_string());
        std::env::set_var("TSDB_NAME", &cli.name);
        std::env::set_var("TSDB_LISTEN", &cli.listen);
        if let Some(n) = cli.ts_length {
            std::env::set_var("TSDB_TS_LENGTH", n.to_string());
        }
        if let Some(schema) = &cli.schema {
            std::env::set_var("TSDB_SCHEMA", schema);
        }
        if cli.memory {
            std::env::set_var("TSDB_ENGINE", "memory");
        }
        let rt = Runtime::new()?;
        return rt.block_on(tsdb_server::serve());
    }

    let Some(command) = cli.command else {
        println!("No command given. Use --help for usage, or run with --serve.");
        return Ok(());
    };
    let client = TsdbClient::new(cli.addr);
    let rt = Runtime::new()?;
    let (status, payload) = rt.block_on(run(&client, command))?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "status": status,
        "payload": payload,
    }))?);
    if status != Status::Ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(client: &TsdbClient, command: Commands) -> Result<(Status, Value)> {
    let reply = match command {
        Commands::Insert { pk, ts } => client.insert_ts(&pk, &parse_series(&ts)?).await,
        Commands::Upsert { pk, set } => client.upsert_meta(&pk, parse_assignments(&set)?).await,
        Commands::Delete { pk } => client.delete_ts(&pk).await,
        Commands::Select { filter, fields } => {
            let (md, additional) = filter.into_parts()?;
            client.select(md, fields, additional).await
        }
        Commands::AugmentedSelect {
            proc,
            target,
            arg,
            filter,
        } => {
            let (md, additional) = filter.into_parts()?;
            client
                .augmented_select(&proc, target, parse_arg(arg.as_deref())?, md, additional)
                .await
        }
        Commands::AddTrigger {
            proc,
            onwhat,
            target,
            arg,
        } => {
            client
                .add_trigger(&proc, &onwhat, target, parse_arg(arg.as_deref())?)
                .await
        }
        Commands::RemoveTrigger { proc, onwhat } => client.remove_trigger(&proc, &onwhat).await,
        Commands::FindSimilar { ts, vpkeys } => client.find_similar(&parse_series(&ts)?, vpkeys).await,
        Commands::MakeVpTree => client.make_vp_tree().await,
    };
    reply.with_context(|| format!("request to {} failed", client.addr()))
}

impl Filter {
    fn into_parts(self) -> Result<(Map<String, Value>, Option<Map<String, Value>>)> {
        let md = parse_assignments(&self.filters)?;
        let mut additional = Map::new();
        if let Some(sort_by) = self.sort_by {
            additional.insert("sort_by".into(), Value::String(sort_by));
        }
        if let Some(limit) = self.limit {
            additional.insert("limit".into(), Value::from(limit));
        }
        Ok((md, (!additional.is_empty()).then_some(additional)))
    }
}

fn parse_series(raw: &str) -> Result<TimeSeries> {
    serde_json::from_str(raw).with_context(|| format!("expected [[times...],[values...]], got {raw}"))
}

fn parse_arg(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(s) => Ok(parse_value(s)),
        None => Ok(Value::Null),
    }
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for pair in pairs {
        let Some((field, value)) = pair.split_once('=') else {
            bail!("expected field=value, got '{pair}'");
        };
        out.insert(field.trim().to_string(), parse_value(value));
    }
    Ok(out)
}
