//! A minimal collaborator binary: answers `SELECT 1` and treats every other
//! simple-query string as a successful no-op statement. Run it and connect
//! with any PostgreSQL client, e.g. `psql -h 127.0.0.1 -p 5433`.
use clap::Parser;
use pgwire_emu::{
    Handler, HandlerResult,
    config::ServerConfig,
    message::backend::{DataValue, FieldDescription},
    reactor, response,
    session::Session,
};

#[derive(Parser)]
#[command(name = "pgwire-emu-demo", version, about = "pgwire-emu echo server")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 5433)]
    port: u16,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,
}

/// Answers `SELECT 1` with a one-row, one-column result; every other
/// statement is acknowledged as an empty `SELECT 0` without touching any
/// storage.
struct EchoHandler;

impl Handler for EchoHandler {
    fn query(&mut self, session: &mut Session, sql: &str) -> HandlerResult {
        let sql = sql.trim().trim_end_matches(';');
        if sql.eq_ignore_ascii_case("select 1") {
            let fields = vec![FieldDescription::text("?column?")];
            let rows: Vec<Vec<DataValue>> = vec![vec![Some("1".into())]];
            response::send_result_set(session, fields, rows, response::command_tag("SELECT", 1));
        } else {
            response::send_result_set(session, vec![], vec![], response::command_tag("SELECT", 0));
        }
        HandlerResult::Continue
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = ServerConfig::default()
        .with_host(args.host.clone())
        .with_port(args.port)
        .with_max_connections(args.max_connections);

    eprintln!("pgwire-emu demo listening on {}:{}", args.host, args.port);
    eprintln!("Connect with: psql -h {} -p {}", args.host, args.port);

    let factory = || Box::new(EchoHandler) as Box<dyn Handler>;

    if let Err(e) = reactor::serve(config, factory, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
