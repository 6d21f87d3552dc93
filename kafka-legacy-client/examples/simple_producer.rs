//! Simple producer example against a single 0.7 broker

use std::sync::Arc;

use kafka_legacy_client::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::var("KAFKA_HOST").unwrap_or_else(|_| "localhost".to_string());
    let topic = "test";

    println!("Kafka legacy client - Simple Producer Example");
    println!("==============================================");

    // Example 1: one channel, explicit partitions
    let client = KafkaClient::connect(host.clone(), DEFAULT_PORT);
    println!("Producing to {}", client.connection_string());

    let mut producer = client.create_producer();
    for partition in 0..3 {
        let payload = format!("Hello partition {}", partition);
        producer.add(Message::new(topic, partition, payload, Compression::None)?)?;
    }
    producer.produce().await?;
    println!("Sent 3 uncompressed messages");

    // Example 2: gzip batch on one partition
    for i in 0..3 {
        let payload = format!("Compressed message #{}", i);
        producer.add(Message::new(topic, 0, payload, Compression::Gzip)?)?;
    }
    producer.produce().await?;
    producer.close();
    println!("Sent one gzip batch of 3 messages");

    // Example 3: connector with keyed routing
    let metadata = Arc::new(
        StaticMetadata::new()
            .with_broker(0, host, DEFAULT_PORT)
            .with_topic(topic, 0, 3),
    );
    let mut connector = ProducerConnector::builder(metadata)
        .compression(Compression::Gzip)
        .build()
        .await?;
    println!("Available topics: {:?}", connector.available_topics());

    for i in 0..10i64 {
        connector
            .add_message(topic, format!("Keyed message #{}", i), Some(i.into()))
            .await?;
    }
    connector.produce().await?;
    connector.close();

    let stats = client.metrics().snapshot();
    println!(
        "Done: {} requests, {} bytes sent",
        stats.requests_sent, stats.bytes_sent
    );
    Ok(())
}
