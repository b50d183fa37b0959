use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use twinsync_gateway::{
    EdgeGateway, GatewayOptions, RumqttLink, SimPlcBank, SimPlcConnector, TcpRobotConnector,
};
use twinsyncd::{config::DaemonConfig, TwinSyncdResult};

#[actix::main]
async fn main() -> TwinSyncdResult<()> {
    let cfg = DaemonConfig::load(DaemonConfig::path_from_env())?;

    LogTracer::init().expect("Unable to set up log tracer");
    let log = rolling::daily(&cfg.log_dir, "twinsyncd");
    let (writer, _guard) = tracing_appender::non_blocking(log);
    let sub = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    log::info!(
        "twinsyncd starting for {}/{}",
        cfg.scope.tenant_id,
        cfg.scope.gateway_id
    );

    let link = RumqttLink::connect(&cfg.mqtt).await?;
    let options = GatewayOptions {
        publish_period: tokio::time::Duration::from_millis(cfg.publish_period_ms),
        ..Default::default()
    };
    let gateway = EdgeGateway::start(cfg.scope.clone(), link, options).await?;

    for robot in &cfg.robots {
        let connector = Box::new(TcpRobotConnector::new(robot));
        match gateway.add_robot(robot.clone(), connector).await {
            Ok(key) => log::info!("robot {key} online"),
            Err(e) => log::error!("robot {} failed to connect: {e}", robot.name),
        }
    }

    // Until a native tag driver lands, PLC entries poll the built-in
    // simulated bank so downstream consumers can be exercised.
    for plc in &cfg.plcs {
        let connector = Box::new(SimPlcConnector::new(SimPlcBank::seeded(), plc));
        match gateway.add_plc(plc.clone(), connector).await {
            Ok(key) => log::info!("plc {key} online"),
            Err(e) => log::error!("plc {} failed to connect: {e}", plc.name),
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");
    gateway.shutdown().await;

    Ok(())
}
