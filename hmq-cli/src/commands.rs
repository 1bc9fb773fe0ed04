//! Command execution.

use crate::{Commands, SendMode};
use colored::Colorize;
use hmq_broker::{BrokerError, Message, Producer, SendResult};
use tokio::sync::oneshot;

/// Executes a command and returns the formatted output.
pub async fn execute(producer: &Producer, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Send {
            topic,
            body,
            keys,
            tags,
            properties,
            count,
            mode,
        } => {
            let mut message = Message::new(topic, read_body_arg(&body)?);
            if let Some(keys) = keys {
                message = message.with_keys(keys);
            }
            if let Some(tags) = tags {
                message = message.with_tags(tags);
            }
            for property in &properties {
                let (name, value) = parse_property(property)?;
                message = message.with_property(name, value);
            }

            tracing::debug!(
                "Sending {} message(s) to topic '{}' via {} ({:?})",
                count,
                message.topic,
                producer.broker_addr(),
                mode
            );
            match mode {
                SendMode::Sync => send_sync(producer, &message, count).await,
                SendMode::Async => send_async(producer, &message, count).await,
                SendMode::Oneway => {
                    for _ in 0..count {
                        producer.send_oneway(&message).await?;
                    }
                    Ok(format!(
                        "{} {} message(s) to {} (oneway)",
                        "Sent".green(),
                        count,
                        message.topic.cyan()
                    ))
                }
            }
        }
    }
}

async fn send_sync(
    producer: &Producer,
    message: &Message,
    count: u32,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut lines = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let result = producer.send(message).await?;
        lines.push(format_result(&result));
    }
    Ok(lines.join("\n"))
}

async fn send_async(
    producer: &Producer,
    message: &Message,
    count: u32,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut pending = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (tx, rx) = oneshot::channel::<Result<SendResult, BrokerError>>();
        producer
            .send_async(
                message,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .await?;
        pending.push(rx);
    }

    let mut lines = Vec::with_capacity(pending.len());
    let mut failed = 0;
    for rx in pending {
        match rx.await {
            Ok(Ok(result)) => lines.push(format_result(&result)),
            Ok(Err(e)) => {
                failed += 1;
                lines.push(format!("{}: {}", "Failed".red(), e));
            }
            Err(_) => {
                failed += 1;
                lines.push(format!("{}: callback dropped", "Failed".red()));
            }
        }
    }
    if failed > 0 {
        lines.push(format!("{} of {} sends failed", failed, count).yellow().to_string());
    }
    Ok(lines.join("\n"))
}

fn format_result(result: &SendResult) -> String {
    match result.queue_offset {
        Some(offset) => format!(
            "{} msg_id={} queue_offset={}",
            "SEND_OK".green(),
            result.msg_id.cyan(),
            offset
        ),
        None => format!("{} msg_id={}", "SEND_OK".green(), result.msg_id.cyan()),
    }
}

/// Reads a body argument; `@path` reads the file at `path`.
fn read_body_arg(arg: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read(path)?),
        None => Ok(arg.as_bytes().to_vec()),
    }
}

/// Splits a `name=value` property argument.
fn parse_property(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("invalid property '{}', expected name=value", arg)),
    }
}
