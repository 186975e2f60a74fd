use anyhow::{anyhow, Context, Result};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaPullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// One record of a `/api/pull` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Thin client for the Ollama HTTP API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn with_config(base_url: String) -> Self {
        OllamaClient {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a single user message and stream back the reply fragments in
    /// order. The stream ends after the last record.
    pub async fn chat_stream(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = OllamaChatRequest {
            model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("could not reach Ollama at {}", self.base_url))?;

        let response = check_status(response).await?;

        let fragments = decode_ndjson::<OllamaChatChunk, _, _, _>(response.bytes_stream())
            .filter_map(|chunk| async move { chat_fragment(chunk) });

        Ok(fragments.boxed())
    }

    /// Concatenated reply for a single prompt.
    #[allow(dead_code)]
    pub async fn chat(&self, model: &str, prompt: &str) -> Result<String> {
        let mut fragments = self.chat_stream(model, prompt).await?;
        let mut response = String::new();
        while let Some(fragment) = fragments.next().await {
            response.push_str(&fragment?);
        }
        Ok(response)
    }

    /// Download `model`, yielding the server's progress records.
    pub async fn pull_stream(&self, model: &str) -> Result<BoxStream<'static, Result<PullProgress>>> {
        let request = OllamaPullRequest { model, stream: true };

        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("could not reach Ollama at {}", self.base_url))?;

        let response = check_status(response).await?;

        let records = decode_ndjson::<PullProgress, _, _, _>(response.bytes_stream()).map(pull_record);

        Ok(records.boxed())
    }
}

/// Reply text carried by one chat record. Records with neither text nor an
/// error (such as the final `done` record without a message) yield nothing.
fn chat_fragment(chunk: Result<OllamaChatChunk>) -> Option<Result<String>> {
    match chunk {
        Ok(OllamaChatChunk { error: Some(e), .. }) => Some(Err(anyhow!(e))),
        Ok(OllamaChatChunk {
            message: Some(message),
            ..
        }) => Some(Ok(message.content)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}

fn pull_record(record: Result<PullProgress>) -> Result<PullProgress> {
    match record {
        Ok(PullProgress { error: Some(e), .. }) => Err(anyhow!(e)),
        other => other,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);

    if detail.trim().is_empty() {
        Err(anyhow!("Ollama API error: {}", status))
    } else {
        Err(anyhow!("Ollama API error ({}): {}", status, detail.trim()))
    }
}

/// Splits a byte stream into newline-terminated lines, holding on to a
/// trailing partial line until the next chunk completes it.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

struct Decoder<S, T> {
    inner: Pin<Box<S>>,
    lines: LineBuffer,
    ready: VecDeque<Result<T>>,
    done: bool,
}

fn parse_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line).with_context(|| format!("malformed stream record: {}", line))
}

/// Decode newline-delimited JSON from a chunked byte stream. A transport
/// error or an unparsable line is yielded as an error and ends the stream.
fn decode_ndjson<T, S, B, E>(bytes: S) -> impl Stream<Item = Result<T>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let decoder = Decoder {
        inner: Box::pin(bytes),
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.ready.pop_front() {
                if item.is_err() {
                    decoder.ready.clear();
                    decoder.done = true;
                }
                return Some((item, decoder));
            }

            if decoder.done {
                return None;
            }

            match decoder.inner.next().await {
                Some(Ok(chunk)) => {
                    for line in decoder.lines.push(chunk.as_ref()) {
                        decoder.ready.push_back(parse_line(&line));
                    }
                }
                Some(Err(e)) => {
                    decoder.done = true;
                    decoder
                        .ready
                        .push_back(Err(anyhow::Error::new(e).context("stream interrupted")));
                }
                None => {
                    decoder.done = true;
                    if let Some(rest) = decoder.lines.finish() {
                        decoder.ready.push_back(parse_line(&rest));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> + Send + 'static {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(p.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_line_buffer_holds_partial_line() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"a\":").is_empty());
        assert_eq!(buffer.push(b"1}\n{\"a\":2}\n\n{"), vec!["{\"a\":1}", "{\"a\":2}"]);
        assert_eq!(buffer.finish(), Some("{".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[tokio::test]
    async fn test_decode_reassembles_split_records() {
        let input = chunks(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"}}\n{\"message\":{\"con",
            "tent\":\"lo\"}}\n",
            "{\"message\":{\"content\":\"!\"},\"done\":true}",
        ]);

        let decoded: Vec<OllamaChatChunk> = decode_ndjson(input)
            .map(|r| r.unwrap())
            .collect()
            .await;

        let text: String = decoded
            .into_iter()
            .filter_map(|c| c.message)
            .map(|m| m.content)
            .collect();
        assert_eq!(text, "Hello!");
    }

    #[tokio::test]
    async fn test_decode_stops_at_malformed_line() {
        let input = chunks(&["{\"status\":\"ok\"}\nnot json\n{\"status\":\"after\"}\n"]);

        let decoded: Vec<Result<PullProgress>> = decode_ndjson(input).collect().await;

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap().status, "ok");
        let err = decoded[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("malformed stream record"));
    }

    #[tokio::test]
    async fn test_decode_reports_transport_error() {
        let input = stream::iter(vec![
            Ok(b"{\"status\":\"pulling manifest\"}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let decoded: Vec<Result<PullProgress>> = decode_ndjson(input).collect().await;

        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_ok());
        assert!(decoded[1].is_err());
    }

    #[test]
    fn test_pull_progress_fields_are_optional() {
        let record: PullProgress = serde_json::from_str("{\"status\":\"pulling manifest\"}").unwrap();
        assert_eq!(record.digest, None);
        assert_eq!(record.total, None);

        let record: PullProgress = serde_json::from_str(
            "{\"status\":\"pulling aabb\",\"digest\":\"sha256:aabb\",\"total\":10,\"completed\":4}",
        )
        .unwrap();
        assert_eq!(record.digest.as_deref(), Some("sha256:aabb"));
        assert_eq!(record.total, Some(10));
        assert_eq!(record.completed, Some(4));
    }

    #[test]
    fn test_chat_request_shape() {
        let request = OllamaChatRequest {
            model: "llama3.2",
            messages: vec![Message {
                role: "user",
                content: "",
            }],
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "");
    }

    #[test]
    fn test_chat_error_record_is_an_error() {
        let chunk = parse_line::<OllamaChatChunk>("{\"error\":\"model crashed\"}");
        let err = chat_fragment(chunk).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "model crashed");

        let done = parse_line::<OllamaChatChunk>("{\"done\":true}");
        assert!(chat_fragment(done).is_none());
    }

    #[test]
    fn test_pull_error_record_is_an_error() {
        let record = parse_line::<PullProgress>("{\"error\":\"pull model manifest: file does not exist\"}");
        let err = pull_record(record).unwrap_err();
        assert!(err.to_string().contains("file does not exist"));

        let record = parse_line::<PullProgress>("{\"status\":\"success\"}");
        assert_eq!(pull_record(record).unwrap().status, "success");
    }

    /// Serves one canned HTTP response on a local port and returns its base URL.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Drain the request so the client is not reset mid-write.
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/x-ndjson\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_error_record_mid_stream_ends_chat() {
        let base_url = serve_once(
            "200 OK",
            "{\"message\":{\"content\":\"Hel\"}}\n{\"error\":\"model crashed\"}\n",
        )
        .await;
        let client = OllamaClient::with_config(base_url);

        let fragments: Vec<Result<String>> = client
            .chat_stream("llama3.2", "hi")
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].as_ref().unwrap(), "Hel");
        assert_eq!(fragments[1].as_ref().unwrap_err().to_string(), "model crashed");
    }

    #[tokio::test]
    async fn test_http_error_includes_server_message() {
        let base_url = serve_once("404 Not Found", "{\"error\":\"model 'x' not found\"}").await;
        let client = OllamaClient::with_config(base_url);

        let err = client.chat("x", "hi").await.unwrap_err().to_string();
        assert!(err.contains("404"));
        assert!(err.contains("model 'x' not found"));
    }

    #[tokio::test]
    async fn test_http_error_on_pull() {
        let base_url = serve_once("500 Internal Server Error", "{\"error\":\"disk full\"}").await;
        let client = OllamaClient::with_config(base_url);

        let err = client.pull_stream("llama3.2").await.err().unwrap().to_string();
        assert_eq!(err, "Ollama API error (500 Internal Server Error): disk full");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let client = OllamaClient::with_config("http://127.0.0.1:9".to_string());
        let err = client.chat("llama3.2", "hi").await.unwrap_err();
        assert!(err.to_string().contains("could not reach Ollama"));
    }
}
