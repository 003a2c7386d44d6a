use std::convert::TryFrom;

use controller::{
    args::Arguments,
    buffer::DrainBuffer,
    events::K8SEventRecorder,
    filter::NodeFilterChain,
    metrics::DrainerMetrics,
    runner::{self, Shutdown},
    settings::Settings,
    telemetry::{prometheus_meter_provider, serve},
    watch::watch_nodes,
    DrainScheduler,
};
use models::{
    cluster::K8SClusterClient,
    constants::COMPONENT,
    node::{APICordonDrainer, CordonDrainer, NoopCordonDrainer},
    pod::PodFilterSet,
    telemetry,
};

use opentelemetry::global;
use prometheus::Registry;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

/// Node notifications buffered between the watch and the scheduler.
const NODE_EVENT_BUFFER: usize = 128;

#[actix_web::main]
async fn main() -> Result<()> {
    let args: Arguments = argh::from_env();
    let settings = Settings::try_from(args).context(controller_error::SettingsSnafu)?;

    telemetry::init_telemetry(settings.debug).context(controller_error::TelemetryInitSnafu)?;

    let kube_config = settings
        .kube_config()
        .await
        .context(controller_error::SettingsSnafu)?;
    let k8s_client =
        kube::client::Client::try_from(kube_config).context(controller_error::ClientCreateSnafu)?;

    // The meter provider has to be installed before any instruments are created.
    let registry = Registry::new();
    let meter_provider =
        prometheus_meter_provider(&registry).context(controller_error::ControllerSnafu)?;
    global::set_meter_provider(meter_provider);

    event!(
        Level::INFO,
        dry_run = settings.dry_run,
        conditions = ?settings.conditions.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Starting node drainer."
    );

    let result = if settings.dry_run {
        run_controller(&settings, k8s_client, NoopCordonDrainer::default(), registry).await
    } else {
        let pod_filters = PodFilterSet::from_config(&settings.pod_filters);
        event!(Level::INFO, filters = ?pod_filters.filter_names(), "Pod filters configured.");
        let drainer = APICordonDrainer::new(
            K8SClusterClient::new(k8s_client.clone()),
            settings.drainer,
            pod_filters,
        );
        run_controller(&settings, k8s_client, drainer, registry).await
    };
    result.context(controller_error::ControllerSnafu)?;

    event!(Level::INFO, "Node drainer stopped.");
    Ok(())
}

/// Runs the node watch, the drain scheduler and the telemetry server until one of them exits or the process is
/// told to stop.
async fn run_controller<D>(
    settings: &Settings,
    k8s_client: kube::Client,
    drainer: D,
    registry: Registry,
) -> controller::Result<()>
where
    D: CordonDrainer + 'static,
{
    let filters = NodeFilterChain::from_settings(settings);
    event!(Level::INFO, filters = ?filters.filter_names(), "Node filters configured.");

    let mut scheduler = DrainScheduler::new(
        drainer,
        K8SEventRecorder::new(k8s_client.clone()),
        DrainerMetrics::new(global::meter(COMPONENT)),
        filters,
        settings.conditions.clone(),
        DrainBuffer::new(settings.drain_buffer),
    );

    let shutdown = Shutdown::new();
    let (sender, receiver) = mpsc::channel(NODE_EVENT_BUFFER);

    runner::run_all(
        vec![
            runner::task("node watch", watch_nodes(k8s_client, sender, shutdown.clone())),
            runner::task("drain scheduler", scheduler.run(receiver, shutdown.clone())),
            runner::task(
                "telemetry server",
                serve(settings.listen_address, registry, shutdown.clone()),
            ),
        ],
        shutdown,
    )
    .await
}

pub mod controller_error {
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Invalid configuration: '{}'", source))]
        Settings { source: controller::Error },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Error running node drainer: '{}'", source))]
        Controller { source: controller::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
