use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{crate_version, Command};

use gitmirror::{CancellationToken, MirrorPool, MirrorPoolConfig, RepoUrl, StateSnapshot};

fn clap() -> Command {
    use clap::{arg, Arg};
    Command::new("gitmirror-admin")
        .version(crate_version!())
        .about("Inspects and maintains a server-side git mirror pool")
        .infer_subcommands(true)
        .arg(
            arg!(-c --config <FILE> "path to the mirror pool's TOML config")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .env("GITMIRROR_CONFIG"),
        )
        .subcommand(
            Command::new("resolve")
                .about("Resolves a remote URL to its on-disk mirror, creating it if needed")
                .arg(Arg::new("url").required(true)),
        )
        .subcommand(Command::new("gc").about("Runs one compaction round over the whole pool"))
        .subcommand(Command::new("status").about("Lists mirrors and any registered errors"))
        .subcommand(
            Command::new("fetch")
                .about("Ensures the given ref=sha pairs are present in a mirror, fetching if needed")
                .arg(Arg::new("url").required(true))
                .arg(Arg::new("ref_shas").required(true).num_args(1..)),
        )
}

fn load_config(path: Option<&Utf8PathBuf>) -> Result<MirrorPoolConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
            MirrorPoolConfig::from_toml_str(&text).with_context(|| format!("parsing config file {path}"))
        }
        None => Ok(MirrorPoolConfig::default()),
    }
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let matches = clap().get_matches();
    let config_path = matches.get_one::<Utf8PathBuf>("config");
    let config = load_config(config_path)?;
    let pool = MirrorPool::new(config);
    let token = CancellationToken::new();

    match matches.subcommand() {
        Some(("resolve", sub)) => {
            let url_arg = sub.get_one::<String>("url").unwrap();
            let url = RepoUrl::parse(url_arg)?;
            let mirror = pool.resolve(&url, &token)?;
            println!("{}\t{}", mirror.hash, mirror.path);
        }
        Some(("gc", _)) => {
            let summary = pool.compactor().run(&token)?;
            println!(
                "expired={} compacted={} skipped_quota={} skipped_not_needed={} failed={}",
                summary.expired_removed, summary.compacted, summary.skipped_quota, summary.skipped_not_needed, summary.failed
            );
        }
        Some(("status", _)) => {
            for mirror in pool.mirror_dirs.all_mirrors()? {
                let error = pool.registry.error_for(&mirror.hash);
                match error {
                    Some(e) => println!("{}\t{}\terror ({}): {}", mirror.hash, mirror.canonical_url, e.occurred_at_rfc3339(), e.message),
                    None => println!("{}\t{}\tok", mirror.hash, mirror.canonical_url),
                }
            }
            if let Some(native_error) = pool.registry.last_native_git_error() {
                println!("last native git error: {native_error}");
            }
        }
        Some(("fetch", sub)) => {
            let url_arg = sub.get_one::<String>("url").unwrap();
            let url = RepoUrl::parse(url_arg)?;
            let mirror = pool.resolve(&url, &token)?;

            let mut refs = BTreeMap::new();
            for pair in sub.get_many::<String>("ref_shas").unwrap() {
                let (refname, sha) = pair
                    .split_once('=')
                    .with_context(|| format!("expected ref=sha, got `{pair}`"))?;
                refs.insert(refname.to_string(), sha.to_string());
            }
            let snapshot = StateSnapshot::new(refs);

            let fetch = pool.fetch_coordinator();
            fetch.ensure_present(&mirror, &snapshot, &Default::default(), &token)?;
            println!("ok");
        }
        _ => {
            clap().print_help()?;
            println!();
        }
    }

    Ok(ExitCode::SUCCESS)
}
