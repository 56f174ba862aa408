use std::{sync::Arc, time::Duration};

use conveyor::{
    handler::HandlerSettings,
    message::{Envelope, QueueMessage},
    publisher::Publisher,
    service::Service,
    transport::memory::InMemoryTransport,
};
use serde::{Deserialize, Serialize};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Greeting {
    name: String,
    flaky: bool,
}

impl QueueMessage for Greeting {}

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CONVEYOR_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let transport = InMemoryTransport::new();

    let service = Service::builder()
        .transport(Arc::new(transport.clone()))
        .error_callback(Arc::new(|error| warn!("service error: {error:#}")))
        .build();

    service.register_handler_with(
        |envelope: Envelope<Greeting>| async move {
            if envelope.body.flaky && envelope.retry_attempts == 0 {
                eyre::bail!("greeting machine still warming up");
            }
            info!(
                name = %envelope.body.name,
                attempt = envelope.retry_attempts,
                "hello"
            );
            Ok(())
        },
        None,
        HandlerSettings::builder()
            .workers(2)
            .max_retries(2)
            .retry_interval(Duration::from_millis(250))
            .double_retry_interval(true)
            .build(),
    )?;

    service.start().await?;

    let publisher = Publisher::new(Arc::new(transport));
    for name in ["mira", "jude", "sol"] {
        publisher
            .publish(Greeting {
                name: name.to_owned(),
                flaky: false,
            })
            .await?;
    }

    // This one fails its first attempt and comes back around on the retry.
    publisher
        .publish(Greeting {
            name: "tobias".to_owned(),
            flaky: true,
        })
        .await?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    println!("{}", service.stats_report().await);

    service.dispose().await;
    Ok(())
}
