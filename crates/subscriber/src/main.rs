use custos_infra::config::SubscriberConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    custos_observability::init();

    let config = SubscriberConfig::from_env()?;
    let subscriber = custos_subscriber::start(&config).await?;

    let canceller = subscriber.pool.canceller();
    let pool = subscriber.pool;
    let mut supervisor = tokio::task::spawn_blocking(move || pool.wait());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested, draining workers");
            canceller.cancel();
            supervisor.await??;
        }
        exited = &mut supervisor => {
            exited??;
            info!("all workers stopped");
        }
    }

    Ok(())
}
