//! SafeSpace - Isolated Environment Orchestrator
//!
//! Thin command-line front end over [`EnvironmentOrchestrator`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use safespace_core::orchestrator::DEFAULT_STALE_AFTER;
use safespace_core::{
    init, EnvironmentOrchestrator, EnvironmentSpec, Impairment, Lookup, Settings, VmRequest,
    WorkloadHint,
};
use tracing::info;

fn print_help() {
    println!("safespace - Isolated Environment Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  safespace [--config PATH] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("  create [OPTIONS]         Create an environment and print its id");
    println!("      --name NAME          Human-readable name (unique among live environments)");
    println!("      --root DIR           Use DIR as the environment root");
    println!("      --template ID        Record the template this environment came from");
    println!("      --network            Give the environment its own network domain");
    println!("      --latency MS         Impair the link: added latency (implies --network)");
    println!("      --loss PCT           Impair the link: packet loss (implies --network)");
    println!("      --vm                 Boot a VM inside the environment");
    println!("      --memory MB          VM memory (implies --vm)");
    println!("      --cpus N             VM vCPUs (implies --vm)");
    println!("      --workload KIND      foreground | vm | background | test-runner");
    println!("  list                     List environments");
    println!("  recall <ID|NAME>         Re-attach to an environment");
    println!("  foreclose <ID|NAME>      Tear an environment down");
    println!("  run <ID|NAME> -- CMD...  Run a command inside an environment");
    println!("  health <ID|NAME>         Check an environment for problems");
    println!("  reconcile                Report registry/host discrepancies");
    println!("  sweep                    Reconcile and remediate");
    println!("  purge [--days N]         Foreclose environments idle for N days (default 30)");
    println!("  config                   Print the effective settings");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config PATH        Settings file (default: $SAFESPACE_CONFIG or");
    println!("                           ~/.config/safespace/config.yaml)");
    println!("  -h, --help               Print this help message");
    println!("  -v, --version            Print version information");
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    while let Some(first) = args.first() {
        match first.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("safespace {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => {
                args.remove(0);
                if args.is_empty() {
                    bail!("--config needs a path");
                }
                config_path = Some(PathBuf::from(args.remove(0)));
            }
            _ => break,
        }
    }

    let Some(command) = (!args.is_empty()).then(|| args.remove(0)) else {
        print_help();
        return Ok(());
    };

    let settings = Settings::load(config_path.as_deref())?;
    init(&settings);
    let orchestrator = EnvironmentOrchestrator::new(settings);

    match command.as_str() {
        "create" => create(&orchestrator, &args).await,
        "list" => list(&orchestrator),
        "recall" => {
            let handle = orchestrator.recall(lookup_arg(&args)?).await?;
            println!("{}\t{}\t{}", handle.id(), handle.status(), handle.root_path().display());
            Ok(())
        }
        "foreclose" => {
            let lookup = lookup_arg(&args)?;
            let record = orchestrator
                .get(lookup.clone())?
                .with_context(|| format!("environment not found: {lookup}"))?;
            let report = orchestrator.foreclose(record.id).await?;
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            println!("{} closed", report.env_id);
            Ok(())
        }
        "run" => run(&orchestrator, &args).await,
        "health" => {
            let issues = orchestrator.check_health(lookup_arg(&args)?).await?;
            if issues.is_empty() {
                println!("healthy");
            }
            for issue in issues {
                println!("{issue}");
            }
            Ok(())
        }
        "reconcile" => {
            let found = orchestrator.reconcile().await?;
            if found.is_empty() {
                println!("no discrepancies");
            }
            for d in found {
                println!("{d}");
            }
            Ok(())
        }
        "sweep" => {
            let report = orchestrator.sweep().await?;
            for d in &report.remediated {
                println!("fixed: {d}");
            }
            for w in &report.warnings {
                eprintln!("warning: {w}");
            }
            Ok(())
        }
        "purge" => {
            let max_age = match flag_value(&args, "--days")? {
                Some(days) => stale_window(&days)?,
                None => DEFAULT_STALE_AFTER,
            };
            let reports = orchestrator.purge_stale(max_age).await?;
            println!("purged {} environment(s)", reports.len());
            Ok(())
        }
        "config" => {
            print!("{}", orchestrator.settings().to_yaml()?);
            Ok(())
        }
        other => {
            eprintln!("error: unrecognized command '{other}'");
            eprintln!("Run 'safespace --help' for usage information.");
            std::process::exit(1);
        }
    }
}

async fn create(orchestrator: &EnvironmentOrchestrator, args: &[String]) -> Result<()> {
    let mut spec = EnvironmentSpec::new();
    let mut impairment: Option<Impairment> = None;
    let mut network = false;
    let mut vm: Option<VmRequest> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("{arg} needs a value"))
        };
        match arg.as_str() {
            "--name" => spec = spec.named(value()?),
            "--root" => spec = spec.at(value()?),
            "--template" => spec = spec.with_template(value()?),
            "--workload" => spec = spec.with_workload(parse_workload(&value()?)?),
            "--network" => network = true,
            "--latency" => impairment.get_or_insert_with(Impairment::default).latency_ms = value()?.parse()?,
            "--loss" => impairment.get_or_insert_with(Impairment::default).loss_percent = value()?.parse()?,
            "--vm" => {
                vm.get_or_insert_with(VmRequest::default);
            }
            "--memory" => vm.get_or_insert_with(VmRequest::default).memory_mb = Some(value()?.parse()?),
            "--cpus" => vm.get_or_insert_with(VmRequest::default).cpus = Some(value()?.parse()?),
            other => bail!("unrecognized create option '{other}'"),
        }
    }

    spec = match impairment {
        Some(shape) => spec.with_impaired_network(shape),
        None if network => spec.with_network(),
        None => spec,
    };
    if let Some(request) = vm {
        spec = spec.with_vm(request);
    }

    let handle = orchestrator.create(spec).await?;
    info!(env_id = %handle.id(), "Created");
    println!("{}\t{}", handle.id(), handle.root_path().display());
    Ok(())
}

fn list(orchestrator: &EnvironmentOrchestrator) -> Result<()> {
    let records = orchestrator.list()?;
    if records.is_empty() {
        println!("no environments");
        return Ok(());
    }
    println!("{:<36}  {:<20}  {:<12}  {:<7}  {:<3}  ROOT", "ID", "NAME", "STATUS", "NETWORK", "VM");
    for r in records {
        println!(
            "{:<36}  {:<20}  {:<12}  {:<7}  {:<3}  {}",
            r.id,
            r.name.as_deref().unwrap_or("-"),
            r.status.to_string(),
            r.network_config.as_ref().map_or("-", |n| n.domain_id.as_str()),
            if r.vm_config.is_some() { "yes" } else { "no" },
            r.root_path.display()
        );
    }
    Ok(())
}

async fn run(orchestrator: &EnvironmentOrchestrator, args: &[String]) -> Result<()> {
    let split = args
        .iter()
        .position(|a| a == "--")
        .context("usage: safespace run <ID|NAME> -- CMD...")?;
    let lookup = lookup_arg(&args[..split])?;
    let argv = &args[split + 1..];
    if argv.is_empty() {
        bail!("no command given after --");
    }

    let handle = orchestrator.recall(lookup).await?;
    let output = orchestrator.run_in(&handle, argv).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    std::process::exit(output.exit_code);
}

fn lookup_arg(args: &[String]) -> Result<Lookup> {
    match args.first() {
        Some(raw) => Ok(Lookup::parse(raw)),
        None => bail!("expected an environment id or name"),
    }
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<String>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => match args.get(i + 1) {
            Some(v) => Ok(Some(v.clone())),
            None => bail!("{flag} needs a value"),
        },
        None => Ok(None),
    }
}

/// `--days N` as a duration.
fn stale_window(days: &str) -> Result<Duration> {
    let days: u64 = days
        .parse()
        .with_context(|| format!("--days expects a whole number, got '{days}'"))?;
    let secs = days
        .checked_mul(24 * 60 * 60)
        .with_context(|| format!("--days {days} is too large"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_workload(raw: &str) -> Result<WorkloadHint> {
    Ok(match raw {
        "foreground" => WorkloadHint::Foreground,
        "vm" => WorkloadHint::Vm,
        "background" => WorkloadHint::Background,
        "test-runner" => WorkloadHint::TestRunner,
        other => bail!("unknown workload '{other}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_window() {
        assert_eq!(stale_window("2").unwrap(), Duration::from_secs(2 * 86_400));
        assert_eq!(stale_window("0").unwrap(), Duration::ZERO);
        assert!(stale_window("-1").is_err());
        assert!(stale_window("soon").is_err());
    }

    #[test]
    fn test_stale_window_overflow_is_an_error() {
        let err = stale_window(&u64::MAX.to_string()).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }
}
