//! End-to-end simulated gateway run: an in-memory MQTT link, one sim
//! robot and one sim PLC, two users joining, one leaving, frames
//! counted along the way. Run with `RUST_LOG=debug` for the full
//! session trace.

use tokio::time::Duration;

use twinsync_core::{GatewayScope, PlcConfig, RobotConfig};
use twinsync_gateway::{
    EdgeGateway, GatewayOptions, MemoryLink, SimPlcBank, SimPlcConnector, SimRobotConnector,
    SimRobotDevice,
};

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    log::info!("Initializing simulated gateway");

    let link = MemoryLink::new();
    let scope = GatewayScope::new("acme", "gw0");
    let gateway = EdgeGateway::start(
        scope,
        link.clone(),
        GatewayOptions {
            publish_period: Duration::from_millis(30),
            ..Default::default()
        },
    )
    .await?;

    let robot_cfg = RobotConfig {
        name: "R1".into(),
        ip: "sim".into(),
        port: 0,
        device_type: "robot-fanuc".into(),
        connect_timeout_ms: 1_000,
        read_timeout_ms: 500,
        stream_period_ms: 30,
    };
    let device = SimRobotDevice::new();
    let robot_key = gateway
        .add_robot(robot_cfg, Box::new(SimRobotConnector::new(device.clone())))
        .await?;

    let plc_cfg: PlcConfig = serde_json::from_str(
        r#"{"name":"plc1","ip":"sim","port":0,"default_period_ms":100}"#,
    )?;
    let connector = SimPlcConnector::new(SimPlcBank::seeded(), &plc_cfg);
    let plc_key = gateway.add_plc(plc_cfg, Box::new(connector)).await?;

    // Two users subscribe to the robot, one to the PLC.
    link.inject(
        "twinsync/acme/gw0/plan/robot-fanuc/R1/userA",
        r#"{"di":[105],"gi":[1],"go":[1]}"#.as_bytes().to_vec(),
    )
    .await;
    link.inject(
        "twinsync/acme/gw0/plan/robot-fanuc/R1/userB",
        r#"{"di":[113,105],"gi":[2]}"#.as_bytes().to_vec(),
    )
    .await;
    link.inject(
        "twinsync/acme/gw0/plan/plc/plc1/userA",
        r#"{"kind":"machineData","items":[{"path":"Station1Status","expand":"udt"},{"path":"Program:MainProgram.PartCount"}]}"#
            .as_bytes()
            .to_vec(),
    )
    .await;

    log::info!(
        "Robot sees union plan: DI={:?} GI={:?} GO={:?}",
        device.applied("DI"),
        device.applied("GI"),
        device.applied("GO")
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let robot_frames = link.published_on(&robot_key.data_topic()).len();
    let plc_frames = link.published_on(&plc_key.data_topic()).len();
    log::info!("After 500 ms: {robot_frames} robot frames, {plc_frames} plc frames");
    assert!(robot_frames > 0, "robot frames should be flowing");
    assert!(plc_frames > 0, "plc frames should be flowing");

    // Heartbeats keep userB alive; userA leaves the robot.
    link.inject("twinsync/acme/gw0/hb/robot-fanuc/R1/userB", Vec::new())
        .await;
    link.inject("twinsync/acme/gw0/leave/robot-fanuc/R1/userA", Vec::new())
        .await;
    log::info!(
        "After userA left, robot plan narrows to DI={:?}",
        device.applied("DI")
    );

    // Everyone leaves; the stream must go quiet.
    link.inject("twinsync/acme/gw0/leave/robot-fanuc/R1/userB", Vec::new())
        .await;
    link.inject("twinsync/acme/gw0/leave/plc/plc1/userA", Vec::new())
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let robot_after = link.published_on(&robot_key.data_topic()).len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        link.published_on(&robot_key.data_topic()).len(),
        robot_after,
        "no frames may flow after the last user left"
    );

    let roster = link.published_on("twinsync/acme/gw0/devices");
    assert!(!roster.is_empty(), "roster must have been published");
    log::info!(
        "Roster published {} times; final: {}",
        roster.len(),
        String::from_utf8_lossy(&roster.last().unwrap().payload)
    );

    gateway.shutdown().await;
    log::info!("Simulated gateway run complete");

    Ok(())
}
