use anyhow::{bail, Context, Result};
use jbdbms_lib::correlator::{BmsTransport, Correlator};
use jbdbms_lib::protocol::{Register, Telemetry};
use log::{error, info, trace, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

use crate::{commandline, mqtt};

/// Maps metric names from the command line onto registers, keeping their
/// order and dropping duplicates.
fn resolve_metrics(names: &[String]) -> Result<Vec<Register>> {
    let mut registers = Vec::new();
    for name in names {
        let selected: &[Register] = match name.trim() {
            "all" => &Register::ALL,
            "status" | "pack-status" => &[Register::PackStatus],
            "cell-voltages" => &[Register::CellVoltages],
            other => bail!("Unknown metric name '{other}'"),
        };
        for register in selected {
            if !registers.contains(register) {
                registers.push(*register);
            }
        }
    }
    Ok(registers)
}

async fn fetch_with_retry<T: BmsTransport>(
    bms: &mut Correlator<T>,
    register: Register,
    retries: u8,
) -> Result<Telemetry> {
    let mut attempt = 0;
    loop {
        match bms.request(register).await {
            Ok(telemetry) => return Ok(telemetry),
            Err(err) if attempt < retries => {
                attempt += 1;
                trace!("Retry {attempt}/{retries} for {register} after: {err}");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Cannot read {register} after {retries} retries"))
            }
        }
    }
}

fn report_protection(telemetry: &Telemetry) {
    if let Telemetry::PackStatus(status) = telemetry {
        if status.protection.any() {
            warn!("Active protections: {}", status.protection.active().join(", "));
        }
    }
}

/// Expands `value` into one `(topic, payload)` pair per leaf. Nulls are skipped.
fn flatten_simple(topic: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_simple(&format!("{topic}/{k}"), v, out);
            }
        }
        Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten_simple(&format!("{topic}/{i}"), v, out);
            }
        }
        Value::String(s) => out.push((topic.to_string(), s.clone())),
        Value::Number(n) => out.push((topic.to_string(), n.to_string())),
        Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
        Value::Null => {}
    }
}

async fn publish(
    publisher: &mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    fetched: &[(Register, Telemetry)],
) -> Result<()> {
    match format {
        commandline::MqttFormat::Json => {
            let mut data_to_publish = serde_json::Map::new();
            data_to_publish.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            for (register, telemetry) in fetched {
                data_to_publish.insert(register.name().to_string(), serde_json::to_value(telemetry)?);
            }
            let json_payload = serde_json::to_string(&data_to_publish)?;
            publisher.publish(publisher.topic(), &json_payload).await?;
            info!("Published {} metric(s) to MQTT.", fetched.len());
        }
        commandline::MqttFormat::Simple => {
            let mut messages = Vec::new();
            for (register, telemetry) in fetched {
                let root_topic = format!("{}/{}", publisher.topic(), register.name());
                flatten_simple(&root_topic, &serde_json::to_value(telemetry)?, &mut messages);
            }
            for (topic, payload) in &messages {
                if let Err(e) = publisher.publish(topic, payload).await {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
        }
    }
    Ok(())
}

async fn poll_cycle<T: BmsTransport>(
    bms: &mut Correlator<T>,
    registers: &[Register],
    retries: u8,
    output: &commandline::DaemonOutput,
    mqtt_publisher: Option<&mqtt::MqttPublisher>,
) {
    let mut fetched = Vec::with_capacity(registers.len());
    for register in registers {
        info!("Fetching metric: {register}");
        match fetch_with_retry(bms, *register, retries).await {
            Ok(telemetry) => {
                report_protection(&telemetry);
                fetched.push((*register, telemetry));
            }
            Err(e) => error!("{e:#}"),
        }
    }

    if fetched.is_empty() {
        info!("No data fetched in this cycle.");
        return;
    }
    match (output, mqtt_publisher) {
        (commandline::DaemonOutput::Mqtt { format, .. }, Some(publisher)) => {
            if let Err(e) = publish(publisher, format, &fetched).await {
                error!("Failed to publish data to MQTT: {e:#}");
            }
        }
        _ => {
            println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
            for (register, telemetry) in &fetched {
                println!("{}: {telemetry:?}", register.name());
            }
            println!("--------------------------");
        }
    }
}

pub async fn run<T: BmsTransport>(
    bms: Correlator<T>,
    output: commandline::DaemonOutput,
    interval: Duration,
    metrics_to_fetch: Vec<String>,
    retries: u8,
) -> Result<()> {
    run_until(
        bms,
        output,
        interval,
        metrics_to_fetch,
        retries,
        tokio::signal::ctrl_c(),
    )
    .await
}

/// Polls until `shutdown` completes, which may interrupt a cycle in the
/// middle of a request.
async fn run_until<T: BmsTransport, S: Future>(
    mut bms: Correlator<T>,
    output: commandline::DaemonOutput,
    interval: Duration,
    metrics_to_fetch: Vec<String>,
    retries: u8,
    shutdown: S,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics_to_fetch:?}"
    );
    let registers = resolve_metrics(&metrics_to_fetch)?;

    let mqtt_publisher = match &output {
        commandline::DaemonOutput::Mqtt { config_file, .. } => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            Some(mqtt::MqttPublisher::new(config).context("Failed to create MQTT publisher")?)
        }
        commandline::DaemonOutput::Console => None,
    };

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = poll_cycle(&mut bms, &registers, retries, &output, mqtt_publisher.as_ref()) => {}
        }
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Interrupted, stopping daemon.");
    Ok(())
}
