use std::sync::Arc;

use sensorlink_lib::config::SensorDefinition;
use sensorlink_lib::device::{IdentityResolver, Recovery, RecoveryPolicy, RecoverySupervisor, StaticTopology};
use sensorlink_lib::serial::mock::{Reply, ScriptedDevice, ScriptedOpener};
use sensorlink_lib::serial::{SensorDriver, SensorFault, SerialError, SerialInterface};

const PORT: &str = "/dev/ttyUSB0";
const BUS_ID: &str = "/sys/devices/platform/soc/3f980000.usb/usb1/1-1/1-1.3/1-1.3:1.0";

struct Bench {
    opener: ScriptedOpener,
    device: ScriptedDevice,
    topology: StaticTopology,
    identity: IdentityResolver,
    driver: SensorDriver,
}

async fn bench() -> Bench {
    let opener = ScriptedOpener::new();
    let device = opener.attach(PORT);
    let topology = StaticTopology::new(&[(PORT, BUS_ID)]);
    let identity = IdentityResolver::new(Box::new(topology.clone()));

    let definition = SensorDefinition::new("Temp,Humidity", "C,RH", BUS_ID);
    let interface = SerialInterface::new(definition.port_settings(PORT), Arc::new(opener.clone()));
    let mut driver = SensorDriver::new(
        &definition.name,
        &definition.units,
        definition.read_command(),
        definition.wait_time(),
        interface,
    );
    driver.reopen().await.unwrap();

    Bench { opener, device, topology, identity, driver }
}

fn supervisor() -> RecoverySupervisor {
    RecoverySupervisor::new(RecoveryPolicy::default())
}

#[tokio::test(start_paused = true)]
async fn test_no_data_then_successful_reopen_does_not_escalate() {
    let mut b = bench().await;
    b.device
        .reply(Reply::Silence)
        .reply(Reply::Silence)
        .reply(Reply::Silence)
        .reply_line("21.4,55.2\r");

    let fault = b.driver.read().await.unwrap_err();
    assert!(matches!(fault.error, SerialError::NoData { .. }));

    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    match recovery {
        Recovery::Recovered(values) => assert_eq!(values.len(), 2),
        other => panic!("expected recovery, got {:?}", other),
    }
    assert!(b.driver.is_enabled());
    // Initial open plus one reopen per retry
    assert_eq!(b.device.opens(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_garbage_disables_only_that_sensor() {
    let mut b = bench().await;
    for _ in 0..4 {
        b.device.reply_line("21.4,ERR\r");
    }

    let fault = b.driver.read().await.unwrap_err();
    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;

    assert_eq!(recovery, Recovery::SensorDisabled);
    assert!(!b.driver.is_enabled());
    assert_eq!(b.driver.last_line(), "21.4,ERR");
    assert_eq!(b.device.pending_replies(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parse_retry_can_succeed() {
    let mut b = bench().await;
    b.device.reply_line("21.4,ERR\r").reply_line("21.5,55.0\r");

    let fault = b.driver.read().await.unwrap_err();
    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    assert!(matches!(recovery, Recovery::Recovered(ref v) if v[0].value == 21.5));
}

#[tokio::test(start_paused = true)]
async fn test_device_moved_to_another_path_reloads() {
    let mut b = bench().await;
    b.device.reply(Reply::Disconnect);

    // Unplugged and re-enumerated under a new name
    b.opener.detach(PORT);
    b.opener.attach("/dev/ttyUSB1");
    b.topology.set(&[("/dev/ttyUSB1", BUS_ID)]);

    let fault = b.driver.read().await.unwrap_err();
    assert!(matches!(fault.error, SerialError::ConnectionError { .. }));

    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    assert_eq!(recovery, Recovery::ReloadSensors);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_at_same_path_reboots() {
    let mut b = bench().await;

    let fault = b.driver.read().await.unwrap_err();
    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    assert_eq!(recovery, Recovery::RebootDevice);
    assert!(b.driver.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_vanished_device_reboots() {
    let mut b = bench().await;
    b.device.reply(Reply::Disconnect);
    b.opener.detach(PORT);
    b.topology.set(&[]);

    assert!(b.identity.to_volatile_path(BUS_ID).is_err());

    let fault = b.driver.read().await.unwrap_err();
    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    assert_eq!(recovery, Recovery::RebootDevice);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_fault_escalates_immediately() {
    let mut b = bench().await;
    let fault = SensorFault {
        sensor: "Temp,Humidity".to_string(),
        error: SerialError::UnknownFault {
            port: PORT.to_string(),
            reason: "ioctl failed".to_string(),
        },
    };

    let recovery = supervisor().recover(&mut b.driver, fault, &b.identity, BUS_ID).await;
    assert_eq!(recovery, Recovery::RebootDevice);
    assert_eq!(b.device.opens(), 1, "no reopen for unclassified faults");
}
