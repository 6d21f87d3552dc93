//! Simple consumer example against a single 0.7 broker

use std::sync::Arc;
use std::time::Duration;

use kafka_legacy_client::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::var("KAFKA_HOST").unwrap_or_else(|_| "localhost".to_string());
    let topic = "test";

    println!("Kafka legacy client - Simple Consumer Example");
    println!("==============================================");

    // Example 1: raw fetch loop on one partition
    let client = KafkaClient::connect(host.clone(), DEFAULT_PORT);
    let mut consumer = client.create_consumer();
    let mut offset = consumer
        .offsets(topic, 0, OffsetTime::Earliest, 1)
        .await?
        .first()
        .copied()
        .unwrap_or_default();
    println!("Reading {}/0 from {}", topic, offset);

    while consumer.fetch(topic, 0, offset, DEFAULT_MAX_FETCH_SIZE).await? {
        let mut received = 0;
        while let Some(message) = consumer.next_message().await? {
            println!(
                "   {} {}",
                message.offset(),
                String::from_utf8_lossy(message.payload())
            );
            received += 1;
        }
        offset = consumer.watermark();
        if received == 0 {
            break;
        }
    }
    consumer.close();

    // Example 2: grouped streams with offset commits
    let metadata = Arc::new(
        StaticMetadata::new()
            .with_broker(0, host, DEFAULT_PORT)
            .with_topic(topic, 0, 3),
    );
    let connector = ConsumerConnector::builder(metadata)
        .group_id("simple-consumer")
        .offset_reset(OffsetReset::Earliest)
        .build()
        .await?;
    let mut context = connector
        .create_message_streams_by_filter(
            &TopicFilter::whitelist("te.*")?,
            DEFAULT_MAX_FETCH_SIZE,
            OffsetReset::Earliest,
        )
        .await?;
    println!("Consuming {} streams", context.len());

    for _ in 0..5 {
        for stream in &mut context {
            match stream.next_message().await {
                Ok(Some(message)) => println!(
                    "   {}/{} {}",
                    stream.topic(),
                    stream.virtual_partition(),
                    String::from_utf8_lossy(message.payload())
                ),
                Ok(None) => {}
                Err(e) => eprintln!("Error on {}/{}: {}", stream.topic(), stream.partition(), e),
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    context.close().await;

    let stats = connector.metrics().snapshot();
    println!(
        "Done: {} messages consumed, {} bytes received",
        stats.messages_consumed, stats.bytes_received
    );
    Ok(())
}
