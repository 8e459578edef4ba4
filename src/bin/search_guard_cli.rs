//! search-guard CLI: 通过编排层执行搜索、查看生效配置、计算请求键的命令行工具
//!
//! Usage:
//!   search-guard-cli search <query> [--identity <id>] [--ttl-secs <n>] [--config <path>]
//!   search-guard-cli config [--config <path>]
//!   search-guard-cli key <method> <resource> <params> [identity]

use anyhow::{bail, Context, Result};
use search_guard::provider::HttpSearchProvider;
use search_guard::{GuardConfig, KeyGenerator, Orchestrator, SearchRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "search" => cmd_search(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "key" => cmd_key(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("search-guard-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"search-guard-cli: 搜索编排层命令行工具

USAGE:
    search-guard-cli <COMMAND> [OPTIONS]

COMMANDS:
    search <query>              Run a search twice through the orchestrator
        --identity <id>         Caller identity (default: cli)
        --ttl-secs <n>          Cache TTL for this call site (default: 300)
    config                      Print the effective configuration as YAML
    key <method> <resource> <params> [identity]
                                Print the request key for a logical request
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --config <path>             YAML config file

ENVIRONMENT:
    SEARCH_GUARD_CONFIG         Config file path when --config is not given
    SEARCH_GUARD_API_KEY        Provider API key
    SEARCH_GUARD_*              Overrides, see the config module docs
    RUST_LOG                    Log filter (default: info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if arg.starts_with("--") {
            skip = true;
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

fn load_config(args: &[String]) -> Result<GuardConfig> {
    let path = flag(args, "--config")
        .map(str::to_string)
        .or_else(|| std::env::var("SEARCH_GUARD_CONFIG").ok());
    let config = match path {
        Some(p) => GuardConfig::from_path(&p).with_context(|| format!("loading config from {p}"))?,
        None => GuardConfig::default(),
    };
    let config = config.apply_env_overrides();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn cmd_search(args: &[String]) -> Result<()> {
    let query = positional(args).join(" ");
    if query.trim().is_empty() {
        bail!("search requires a query");
    }
    let identity = flag(args, "--identity").unwrap_or("cli");
    let ttl_secs: u64 = flag(args, "--ttl-secs")
        .map(str::parse::<u64>)
        .transpose()
        .context("--ttl-secs must be an integer")?
        .unwrap_or(300);

    let config = load_config(args)?;
    let provider = Arc::new(HttpSearchProvider::new(&config.provider)?);
    let orchestrator = Orchestrator::new(config, provider)?;

    for round in 1..=2 {
        let request = SearchRequest::search(&query, identity, Duration::from_secs(ttl_secs))
            .with_param("part", "snippet")
            .with_param("type", "video")
            .with_param("maxResults", 10);
        let response = orchestrator.execute(request).await;
        println!("--- round {round} (status {}) ---", response.status);
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    println!("--- stats ---");
    println!("{:#?}", orchestrator.stats());
    orchestrator.shutdown();
    Ok(())
}

fn cmd_config(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn cmd_key(args: &[String]) -> Result<()> {
    let parts = positional(args);
    let [method, resource, params, rest @ ..] = parts.as_slice() else {
        bail!("key requires <method> <resource> <params> [identity]");
    };
    let identity = rest.first().copied().unwrap_or("");
    let key = KeyGenerator::new().generate(method, resource, params, identity);
    println!("{key}");
    Ok(())
}
