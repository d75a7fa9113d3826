use std::time::Duration;

use reqwire::prelude::{Body, Client, Config, Error, RequestOptions, StatusPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct CreateItem<'a> {
    name: &'a str,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    json: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder()
        .config(
            Config::default()
                .timeout(Duration::from_secs(3))
                .retries(2)
                .retry_delay(Duration::from_millis(200)),
        )
        .metrics_enabled(true)
        .try_build()?;

    let ping = client.get("https://httpbin.org/get?from=reqwire").await?;
    println!(
        "GET /get => status={} body_bytes={} attempts={}",
        ping.status(),
        ping.body().len(),
        ping.attempts()
    );

    let payload = CreateItem {
        name: "demo",
        enabled: true,
    };
    let echoed: EchoResponse = client
        .post("https://httpbin.org/anything", Body::json(&payload))
        .await?
        .json()?;
    println!("POST /anything => echoed={:?}", echoed.json);

    let outcome = client
        .request(
            RequestOptions::new("https://httpbin.org/status/503")
                .retries(1)
                .status_policy(StatusPolicy::Error),
        )
        .await;
    match outcome {
        Ok(response) => println!("unexpected success: {}", response.status()),
        Err(error @ Error::BadStatus { .. }) => {
            println!("GET /status/503 => code={} status={}", error.code(), error.status());
        }
        Err(other) => return Err(other.into()),
    }

    println!("metrics => {:?}", client.metrics_snapshot());
    Ok(())
}
