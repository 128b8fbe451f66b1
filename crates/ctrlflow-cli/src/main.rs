use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use ctrlflow_runtime::signal::{self, ArithmeticError, FaultSignal};
use ctrlflow_runtime::thread::{self, EXIT_FAILURE, EXIT_SUCCESS};
use ctrlflow_runtime::{
    errno, panic, recover, scope, scoped_defer, throw, try_catch, ErrorCode, RuntimeConfig,
};
use miette::{IntoDiagnostic, Result};

#[derive(Parser)]
#[command(name = "ctrlflow")]
#[command(author, version, about = "Exceptions, fault translation and defer/panic/recover")]
struct Cli {
    /// Runtime configuration file (ctrlflow.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk through try/catch/finally, fault translation and panic/recover
    Demo,

    /// Time a file write with and without a deferred close
    Bench {
        /// Iterations per variant
        #[arg(long, default_value_t = 100)]
        runs: u32,
    },

    /// Print the symbolic name and description of an errno code
    Errno {
        /// Numeric error code
        code: i32,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))?;
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path).into_diagnostic()?,
        None => RuntimeConfig::default(),
    };
    ctrlflow_runtime::init(&config).into_diagnostic()?;

    match cli.command {
        Commands::Demo => {
            // An exception or panic the demo fails to handle ends only this
            // runtime thread, which reports it as a status.
            let status = thread::run(|| match demo(&config) {
                Ok(()) => EXIT_SUCCESS,
                Err(report) => {
                    eprintln!("{report:?}");
                    EXIT_FAILURE
                }
            });
            if status != EXIT_SUCCESS {
                return Err(miette::miette!("demo exited with status {status}"));
            }
        }
        Commands::Bench { runs } => {
            let dir = tempfile::tempdir().into_diagnostic()?;
            let path = dir.path().join("temp.txt");
            benchmark("with_defer", runs, || with_defer(&path))?;
            benchmark("without_defer", runs, || without_defer(&path))?;
        }
        Commands::Errno { code } => {
            println!(
                "{}: {}",
                errno::error_name(code),
                errno::error_description(code)
            );
        }
    }

    Ok(())
}

fn demo(config: &RuntimeConfig) -> Result<()> {
    let effective = toml::to_string(config).into_diagnostic()?;
    println!("config:\n{}", effective.trim_end());

    let caught = Cell::new(None);
    let finally_ran = Cell::new(false);
    try_catch! {
        { throw(5i32); }
        catch (i32, e) { caught.set(Some(e)); }
        finally { finally_ran.set(true); }
    }
    println!(
        "throw:     caught {:?}, finally ran: {}",
        caught.get(),
        finally_ran.get()
    );

    let order = RefCell::new(Vec::new());
    try_catch! {
        { order.borrow_mut().push("try"); }
        catch (i32, _e) { order.borrow_mut().push("catch"); }
        finally { order.borrow_mut().push("finally"); }
    }
    println!("no throw:  {}", order.into_inner().join(" -> "));

    let was_enabled = signal::is_enabled();
    if !was_enabled {
        signal::enable().into_diagnostic()?;
    }
    let fault = Cell::new(None);
    try_catch! {
        { signal::raise(FaultSignal::Fpe).unwrap_or_else(|err| log::error!("{err}")); }
        catch (ArithmeticError, e) { fault.set(Some(e.message)); }
    }
    if !config.signals.catch {
        signal::disable().into_diagnostic()?;
    }
    println!("sigfpe:    {}", fault.get().unwrap_or("not caught"));

    let cleanups = Rc::new(RefCell::new(Vec::new()));
    scope(|| {
        for n in 1..=2 {
            let cleanups = Rc::clone(&cleanups);
            scoped_defer(move |n| cleanups.borrow_mut().push(n), n);
        }
    });
    println!("defer:     cleanups ran in order {:?}", cleanups.borrow());

    cleanups.borrow_mut().clear();
    let recovered = scope(|| {
        recover(|| {
            scope(|| {
                for n in 1..=2 {
                    let cleanups = Rc::clone(&cleanups);
                    scoped_defer(move |n| cleanups.borrow_mut().push(n), n);
                }
                panic(ErrorCode::EINVAL)
            })
        })
    });
    match recovered {
        Ok(()) => println!("recover:   no panic"),
        Err(code) => println!(
            "recover:   {} after cleanups {:?}",
            code.name(),
            cleanups.borrow()
        ),
    }

    Ok(())
}

fn with_defer(path: &Path) -> std::io::Result<()> {
    scope(|| {
        let file = scoped_defer(drop, Rc::new(File::create(path)?));
        (&*file).write_all(b"test")
    })
}

fn without_defer(path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(b"test")?;
    drop(file);
    Ok(())
}

fn benchmark(name: &str, runs: u32, mut callback: impl FnMut() -> std::io::Result<()>) -> Result<()> {
    let mut min = f64::INFINITY;
    let mut max = 0f64;
    let mut total = 0f64;

    for _ in 0..runs {
        let start = Instant::now();
        callback().into_diagnostic()?;
        let elapsed = start.elapsed().as_secs_f64();

        min = min.min(elapsed);
        max = max.max(elapsed);
        total += elapsed;
    }

    let avg = if runs == 0 { 0.0 } else { total / f64::from(runs) };
    if runs == 0 {
        min = 0.0;
    }
    eprintln!("{name} ({runs} runs):\nmin: {min:.6}s\navg: {avg:.6}s\nmax: {max:.6}s");
    Ok(())
}
