use std::env;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};

use pkgmerge::config::ConfigLayers;
use pkgmerge::core::runner::CliRunner;
use pkgmerge::logging::{init_logging, parse_early_log_config};
use pkgmerge::models::Commands;
use pkgmerge::{Args, Config};

#[tokio::main]
async fn main() -> ExitCode {
    // Logging comes up before clap so argument handling is traced too.
    let raw_args: Vec<String> = env::args().collect();
    let _log_guard = init_logging(parse_early_log_config(&raw_args));

    let args = Args::parse();

    // Handle --create-config flag
    if args.create_config {
        return match Config::create_sample_config() {
            Ok(path) => {
                println!("Sample configuration at {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    let Some(command) = args.command.clone() else {
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    };

    let cli = match &command {
        Commands::Run(run) => args.global_config().merge(run.scheduling.to_config()),
        Commands::Resume(resume) => args.global_config().merge(resume.scheduling.to_config()),
        Commands::Status(_) | Commands::Discard(_) => args.global_config(),
    };
    let layers = match ConfigLayers::load(args.config.as_deref(), cli) {
        Ok(layers) => layers,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut runner = CliRunner::new(args.output, args.quiet);
    let result = match &command {
        Commands::Run(run) => runner.run(&run.graph, &layers).await,
        Commands::Resume(resume) => runner.resume(resume.graph.as_deref(), &layers).await,
        Commands::Status(_) => runner.status(&layers.target_root()),
        Commands::Discard(_) => runner.discard(&layers.target_root()),
    };

    // Errors were already reported on the output stream.
    if result.is_success()
        && !args.quiet
        && let Some(message) = &result.message
    {
        eprintln!("{}", message);
    }
    result.exit_code.into()
}
