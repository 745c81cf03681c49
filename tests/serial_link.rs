use std::sync::Arc;

use sensorlink_lib::config::SensorDefinition;
use sensorlink_lib::serial::mock::{Reply, ScriptedDevice, ScriptedOpener};
use sensorlink_lib::serial::{SensorDriver, SerialError, SerialInterface};

const PORT: &str = "/dev/ttyUSB0";

fn link(opener: &ScriptedOpener) -> SerialInterface {
    let settings = SensorDefinition::new("pH", "N/A", PORT).port_settings(PORT);
    SerialInterface::new(settings, Arc::new(opener.clone()))
}

async fn driver(names: &str, units: &str) -> (ScriptedDevice, SensorDriver) {
    let opener = ScriptedOpener::new();
    let device = opener.attach(PORT);
    let definition = SensorDefinition::new(names, units, PORT);
    let mut driver = SensorDriver::new(
        names,
        units,
        definition.read_command(),
        definition.wait_time(),
        link(&opener),
    );
    driver.reopen().await.unwrap();
    (device, driver)
}

#[tokio::test(start_paused = true)]
async fn test_send_frames_command_and_drops_stale_input() {
    let opener = ScriptedOpener::new();
    let device = opener.attach(PORT);
    let mut link = link(&opener);

    assert!(matches!(link.send("R").await, Err(SerialError::ConnectionError { .. })));
    assert!(link.last_error().is_some());

    link.open().await.unwrap();
    link.open().await.unwrap();
    assert_eq!(device.opens(), 1, "open must be idempotent");

    // The answer to the first command is never read
    device.reply_line("*OK\r").reply_line("6.8\r");
    link.send("L1").await.unwrap();
    link.send("R").await.unwrap();

    assert_eq!(link.read_line().await.unwrap(), "6.8");
    assert_eq!(device.sent(), vec!["L1\r".to_string(), "R\r".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_read_line_distinguishes_silence_from_truncation() {
    let opener = ScriptedOpener::new();
    let device = opener.attach(PORT);
    let mut link = link(&opener);
    link.open().await.unwrap();

    device.reply(Reply::Silence);
    link.send("R").await.unwrap();
    assert!(matches!(link.read_line().await, Err(SerialError::NoData { .. })));

    device.reply_line("21.4,5");
    link.send("R").await.unwrap();
    match link.read_line().await {
        Err(SerialError::CorruptData { partial, .. }) => assert_eq!(partial, "21.4,5"),
        other => panic!("expected CorruptData, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_and_closed_link() {
    let opener = ScriptedOpener::new();
    let device = opener.attach(PORT);
    let mut link = link(&opener);
    link.open().await.unwrap();

    device.reply(Reply::WriteTimeout);
    assert!(matches!(link.send("R").await, Err(SerialError::WriteTimeout { .. })));

    link.close();
    link.close();
    assert!(!link.is_open());
    assert!(matches!(link.read_line().await, Err(SerialError::ConnectionError { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_driver_pairs_values_with_names() {
    let (device, mut driver) = driver("Temp, Humidity", "C,RH").await;
    device.reply_line("21.4,55.2\r");

    let fragment = driver.read().await.unwrap();
    assert_eq!(fragment.len(), 2);
    assert_eq!(fragment[0].name, "Temp");
    assert_eq!(fragment[0].value, 21.4);
    assert_eq!(fragment[1].unit, "RH");
    assert_eq!(driver.last_line(), "21.4,55.2");
}

#[tokio::test(start_paused = true)]
async fn test_empty_answer_is_an_empty_fragment() {
    let (device, mut driver) = driver("pH", "N/A").await;
    device.reply_line("\r");
    assert!(driver.read().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_token_keeps_the_raw_line() {
    let (device, mut driver) = driver("pH", "N/A").await;
    device.reply_line("6.8,*OK\r");

    let fault = driver.read().await.unwrap_err();
    assert_eq!(fault.sensor, "pH");
    match fault.error {
        SerialError::InvalidDataType { token, raw_line, .. } => {
            assert_eq!(token, "*OK");
            assert_eq!(raw_line, "6.8,*OK");
        }
        other => panic!("expected InvalidDataType, got {:?}", other),
    }
    assert_eq!(driver.last_line(), "6.8,*OK");
    assert!(driver.is_enabled());
}
