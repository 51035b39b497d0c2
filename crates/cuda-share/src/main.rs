use std::io::Write;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use cuda_api::device;
use cuda_api::Device;
use cuda_api::Runtime;
use cuda_share::channel::ExporterChannel;
use cuda_share::channel::ImporterChannel;
use cuda_share::config::AttachArgs;
use cuda_share::config::Cli;
use cuda_share::config::Commands;
use cuda_share::config::ServeArgs;
use cuda_share::session;
use cuda_share::session::ServeOptions;
use tracing::level_filters::LevelFilter;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> Result<()> {
    setup_global_hooks();
    utils::logging::init(LevelFilter::INFO);

    let cli = Cli::parse();
    tracing::debug!("cuda-share {}", &**version::VERSION);

    let runtime = Runtime::new().context("CUDA driver initialization failed")?;

    match cli.command {
        Commands::Info => run_info(&runtime),
        Commands::Serve(serve_args) => run_serve(&runtime, serve_args),
        Commands::Attach(attach_args) => run_attach(&runtime, attach_args),
    }
}

fn run_info(runtime: &Runtime) -> Result<()> {
    let version = device::driver_version(runtime)?;
    println!("driver {version}");

    for device in Device::all(runtime)? {
        println!(
            "[{}] {} ({}) {} MiB",
            device.ordinal(),
            device.name()?,
            device.pci_bus_id()?,
            device.total_memory()? >> 20
        );
    }
    Ok(())
}

fn run_serve(runtime: &Runtime, serve_args: ServeArgs) -> Result<()> {
    let options = ServeOptions::from(&serve_args);
    let export = session::prepare_export(runtime, &options).context("export failed")?;

    let (pending, server_name) = ExporterChannel::listen().context("listen failed")?;
    // the importer reads this line, keep it the only thing on stdout
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{server_name}")?;
    stdout.flush()?;
    drop(stdout);

    tracing::info!(server = %server_name, "waiting for an importer");
    let channel = pending.accept().context("accepting importer failed")?;
    let report = session::serve(&channel, &export)?;

    if !report.is_verified() {
        bail!("importer rejected the buffer: {report:?}");
    }
    Ok(())
}

fn run_attach(runtime: &Runtime, attach_args: AttachArgs) -> Result<()> {
    let channel = ImporterChannel::connect(&attach_args.server)
        .with_context(|| format!("connecting to {} failed", attach_args.server))?;
    let report = session::attach(runtime, attach_args.device, &channel)?;

    println!("{report:?}");
    if !report.is_verified() {
        bail!("buffer contents did not match the advertised pattern");
    }
    Ok(())
}
