use std::time::Duration;

use reqwire::prelude::{Client, Config, FileSink, RequestOptions, WriterSink};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder()
        .config(Config::default().timeout(Duration::from_secs(10)).retries(2))
        .try_build()?;

    let target = std::env::temp_dir().join("reqwire-fan-out.bin");
    let file = FileSink::create(&target).await?;

    // Every chunk goes to the file and to a discarding writer; the response
    // itself keeps no copy of the body.
    let handle = client
        .request(
            RequestOptions::new("https://httpbin.org/bytes/2048")
                .no_storage(true)
                .wait(true),
        )
        .pipe(file)
        .pipe(WriterSink::new(tokio::io::sink()))
        .on_header(|line| println!("header: {line}"));
    let abort = handle.abort_handle();

    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        abort.abort();
    });

    let response = handle.send().await?;
    watchdog.abort();

    let written = tokio::fs::metadata(&target).await?.len();
    println!(
        "status={} attempts={} file={} bytes={written}",
        response.status(),
        response.attempts(),
        target.display()
    );
    Ok(())
}
