use jobworks_worker::app::build_worker;
use jobworks_worker::config::WorkerConfig;
use jobworks_worker::entry::{Mode, exit_code, parse_mode};
use jobworks_worker::jobs::builtin_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobworks_observability::init();

    let mode = parse_mode(std::env::args().skip(1))?;
    let config = WorkerConfig::from_env()?;
    let worker = build_worker(&config, builtin_registry()).await?;

    match mode {
        Mode::RunInstance(instance_id) => {
            let result = worker.run_instance(instance_id).await;
            match &result {
                Ok(exit) => {
                    if let Some(err) = exit.error() {
                        tracing::warn!(instance_id = %instance_id, error = %err, "job did not succeed");
                    }
                }
                Err(err) => tracing::error!(instance_id = %instance_id, error = %err, "job instance not run"),
            }
            std::process::exit(exit_code(&result));
        }
        Mode::Submit { job, args } => {
            let record = worker.create_job(&job, args, std::env::var("USER").ok()).await?;
            println!("{}", record.id);
        }
        Mode::Serve => {
            worker.listen().await?;
            tracing::info!("worker listening; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            worker.shutdown().await?;
        }
    }
    Ok(())
}
