use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use std::io::Write;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let base_url =
        std::env::var("CHAT_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What is task decomposition for LLM agents?".to_string());

    println!("🔍 Asking: {}\n", question);

    let payload = json!({
        "messages": [{ "role": "user", "content": question }],
        "configurable": { "thread_id": "demo-client" }
    });

    let response = client
        .post(format!("{}/chat/messages", base_url))
        .json(&payload)
        .send()
        .await?;

    if !response.status().is_success() {
        println!("Status: {}", response.status());
        println!("Response: {}", response.text().await?);
        return Ok(());
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut stdout = std::io::stdout();

    'frames: while let Some(bytes) = stream.next().await {
        buffer.extend_from_slice(&bytes?);

        while let Some(end) = buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = buffer.drain(..end + 2).collect();
            let frame = String::from_utf8_lossy(&raw);
            let Some(data) = frame.trim().strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break 'frames;
            }

            let value: serde_json::Value = serde_json::from_str(data)?;
            if let Some(text) = value["text"].as_str() {
                print!("{}", text);
                stdout.flush()?;
            } else if let Some(error) = value["error"].as_str() {
                println!("\n❌ {}", error);
            }
        }
    }

    println!("\n\n✅ Stream completed!");
    Ok(())
}
