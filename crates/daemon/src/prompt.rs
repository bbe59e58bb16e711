use async_trait::async_trait;
use legacy_tunnel::Prompter;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tunnel_protocol::Question;

type Input = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Answers legacy prompts on a line-oriented terminal.
pub(crate) struct TerminalPrompter {
    io: Mutex<(Input, Output)>,
}

impl TerminalPrompter {
    pub(crate) fn new(
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let input: Box<dyn AsyncRead + Send + Unpin> = Box::new(input);
        Self {
            io: Mutex::new((BufReader::new(input), Box::new(output))),
        }
    }

    pub(crate) fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stderr())
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn ask(&self, question: Question) -> anyhow::Result<Value> {
        let mut io = self.io.lock().await;
        let (input, output) = &mut *io;

        if let Some(error) = &question.error {
            output.write_all(format!("{error}\n").as_bytes()).await?;
        }
        let message = question.message.as_deref().unwrap_or(&question.name);
        output.write_all(format!("{message}\n").as_bytes()).await?;
        for (index, choice) in question.choices.iter().enumerate() {
            let label = choice
                .message
                .clone()
                .unwrap_or_else(|| display(&choice.value));
            output
                .write_all(format!("  {}) {label}\n", index + 1).as_bytes())
                .await?;
        }

        loop {
            output.write_all(b"> ").await?;
            output.flush().await?;
            let mut line = String::new();
            if input.read_line(&mut line).await? == 0 {
                anyhow::bail!("input closed while prompting for \"{}\"", question.name);
            }
            match interpret(&question, line.trim()) {
                Ok(answer) => return Ok(answer),
                Err(retry) => output.write_all(format!("{retry}\n").as_bytes()).await?,
            }
        }
    }
}

/// Turns a typed line into the answer value, or the message to show before asking again.
fn interpret(question: &Question, line: &str) -> Result<Value, String> {
    if !question.choices.is_empty() {
        let by_number = line
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| question.choices.get(index));
        let by_value = question
            .choices
            .iter()
            .find(|choice| display(&choice.value) == line);
        return by_number
            .or(by_value)
            .map(|choice| choice.value.clone())
            .ok_or_else(|| format!("Please pick one of 1-{}", question.choices.len()));
    }
    if matches!(question.kind.as_str(), "toggle" | "confirm") {
        return match line.to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" => Ok(Value::Bool(true)),
            "" | "n" | "no" | "false" => Ok(Value::Bool(false)),
            _ => Err("Please answer yes or no".to_string()),
        };
    }
    if line.is_empty() && question.required == Some(true) {
        return Err(question
            .validate_message
            .clone()
            .unwrap_or_else(|| "A value is required".to_string()));
    }
    if question.kind == "numeral" {
        return line
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| "Please enter a number".to_string());
    }
    Ok(Value::String(line.to_string()))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
