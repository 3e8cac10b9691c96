use anyhow::Result;
use std::{env, path::PathBuf, process};

mod runner;
mod scenario;

fn main() {
    let paths: Vec<PathBuf> = env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: testjig <scenario.json | directory>...");
        process::exit(2);
    }

    match run_all(&paths) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    }
}

fn run_all(paths: &[PathBuf]) -> Result<bool> {
    let files = scenario::collect(paths)?;
    let mut failed = 0;
    for file in &files {
        let scenario = scenario::load(file)?;
        let report = runner::run(&scenario)?;
        if report.passed() {
            println!("PASS {} ({} steps)", report.name, report.steps);
        } else {
            failed += 1;
            println!("FAIL {}", report.name);
            for m in &report.mismatches {
                println!("    {m}");
            }
        }
    }
    println!(
        "{} scenarios, {} passed, {} failed",
        files.len(),
        files.len() - failed,
        failed
    );
    Ok(failed == 0)
}
