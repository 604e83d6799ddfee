use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use orb_rpc::{Connection, ConnectionConfig};
use orb_server::{ObjectServer, ServerConfig};
use orb_store::{register_array_class, ObjectDb, PersistentArray, StoreConfig};
use orb_types::{ClassRegistry, Value};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Init(args) => cmd_init(args),
        Command::Serve(args) => cmd_serve(args),
        Command::Gc(args) => cmd_gc(args, &cli.format),
        Command::Call(args) => cmd_call(args, &cli.format),
    }
}

fn registry() -> anyhow::Result<Arc<ClassRegistry>> {
    let registry = ClassRegistry::new();
    register_array_class(&registry)?;
    Ok(Arc::new(registry))
}

fn open_db(config: StoreConfig) -> anyhow::Result<ObjectDb> {
    let path = config.path.clone();
    ObjectDb::open(config, registry()?)
        .with_context(|| format!("opening store {}", path.display()))
}

fn cmd_init(args: InitArgs) -> anyhow::Result<()> {
    let db = open_db(StoreConfig::new(&args.db))?;
    let class = register_array_class(db.registry())?;
    db.create(Value::object(PersistentArray::new(class)))?;
    println!(
        "{} Initialized orb store in {}",
        "✓".green().bold(),
        args.db.display().to_string().bold()
    );
    Ok(())
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(db) = args.db {
        config.store.path = db;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    ensure_store(&config.store.path)?;
    let db = open_db(config.store.clone())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let server = ObjectServer::bind(config, Value::object(db)).await?;
        println!(
            "orb server on {} (store: {})",
            server.local_addr()?.to_string().bold(),
            server.config().store.path.display()
        );
        server
            .serve_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn ensure_store(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!(
            "no store at {}; create one with `orb init --db {}`",
            path.display(),
            path.display()
        );
    }
    Ok(())
}

fn cmd_gc(args: GcArgs, format: &OutputFormat) -> anyhow::Result<()> {
    ensure_store(&args.db)?;
    let db = open_db(StoreConfig::new(&args.db))?;
    let removed = db.gc()?;
    let remaining = db.object_count()?;
    match format {
        OutputFormat::Text => println!(
            "{} GC: {} objects removed, {} remaining.",
            "✓".green(),
            removed,
            remaining
        ),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "removed": removed, "remaining": remaining })
        ),
    }
    Ok(())
}

fn cmd_call(args: CallArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let conn = Connection::connect_with(
        &args.host,
        args.port,
        Value::Nil,
        ConnectionConfig::with_registry(registry()?),
    )
    .with_context(|| format!("connecting to {}:{}", args.host, args.port))?;
    let call_args = args.args.iter().map(|a| parse_arg(a)).collect();
    // Render before closing: references in the result still need the peer.
    let rendered = conn
        .call(&args.method, call_args, None)
        .map(|value| match format {
            OutputFormat::Text => value.inspect(),
            OutputFormat::Json => to_json(&value).to_string(),
        });
    conn.close();
    println!("{}", rendered?);
    Ok(())
}

/// Command-line argument to value: integers, floats, booleans, `nil`,
/// `:symbol`, and everything else as a string.
pub(crate) fn parse_arg(arg: &str) -> Value {
    if let Ok(n) = arg.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = arg.parse::<f64>() {
        return Value::Float(f);
    }
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "nil" => Value::Nil,
        _ => match arg.strip_prefix(':') {
            Some(sym) if !sym.is_empty() => Value::symbol(sym),
            _ => Value::Str(arg.to_string()),
        },
    }
}

pub(crate) fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Symbol(s) => json!({ "symbol": s }),
        Value::Range(r) => json!({ "start": r.start, "end": r.end, "exclusive": r.exclusive }),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => serde_json::Value::Array(
            pairs
                .iter()
                .map(|(k, v)| json!([to_json(k), to_json(v)]))
                .collect(),
        ),
        Value::Error(e) => json!({ "error": e.class, "message": e.message, "trace": e.trace }),
        Value::Object(_) => json!({ "object": value.inspect() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_types::{ErrorValue, Range};

    #[test]
    fn arguments_are_typed() {
        assert_eq!(parse_arg("10"), Value::Int(10));
        assert_eq!(parse_arg("-2.5"), Value::Float(-2.5));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("nil"), Value::Nil);
        assert_eq!(parse_arg(":name"), Value::symbol("name"));
        assert_eq!(parse_arg(":"), Value::Str(":".into()));
        assert_eq!(parse_arg("brian"), Value::Str("brian".into()));
    }

    #[test]
    fn json_rendering() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::Nil,
            Value::Range(Range::exclusive(0, 3)),
            Value::Error(ErrorValue::new("RuntimeError", "boom")),
        ]);
        let json = to_json(&v);
        assert_eq!(json[0], 1);
        assert!(json[1].is_null());
        assert_eq!(json[2]["exclusive"], true);
        assert_eq!(json[3]["error"], "RuntimeError");
    }

    #[test]
    fn init_then_gc_keeps_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("orb.db");
        cmd_init(InitArgs { db: db.clone() }).unwrap();
        cmd_gc(GcArgs { db: db.clone() }, &OutputFormat::Text).unwrap();

        let store = open_db(StoreConfig::new(&db)).unwrap();
        let len = store
            .transaction(true, |root| Ok(root.send("length", vec![], None)?))
            .unwrap();
        assert_eq!(len, Value::Int(0));
    }

    #[test]
    fn gc_refuses_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.db");
        assert!(cmd_gc(GcArgs { db: missing }, &OutputFormat::Json).is_err());
    }
}
