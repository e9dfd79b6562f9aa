use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;

use crate::http;
use crate::tool::Tool;
use bsj_llm::ToolDefinition;
use bsj_types::BsjError;

const NAME: &str = "text_to_speech";
const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

/// Speech synthesis through ElevenLabs. Audio is written as an mp3 into
/// `output_dir` and the tool returns the file path.
pub struct SpeechTool {
    api_key: String,
    base_url: String,
    voice_id: String,
    output_dir: PathBuf,
    client: reqwest::Client,
}

impl SpeechTool {
    pub fn new(api_key: String, output_dir: PathBuf) -> Self {
        Self {
            api_key,
            base_url: "https://api.elevenlabs.io".to_string(),
            voice_id: DEFAULT_VOICE.to_string(),
            output_dir,
            client: http::client(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_voice(mut self, voice_id: String) -> Self {
        self.voice_id = voice_id;
        self
    }

    /// `None` when `ELEVENLABS_API_KEY` is not set.
    pub fn from_env(output_dir: PathBuf) -> Option<Self> {
        let key = std::env::var("ELEVENLABS_API_KEY").ok()?;
        let tool = Self::new(key, output_dir);
        Some(match std::env::var("ELEVENLABS_VOICE_ID") {
            Ok(voice) => tool.with_voice(voice),
            Err(_) => tool,
        })
    }
}

#[async_trait]
impl Tool for SpeechTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: NAME.to_string(),
            description: "Synthesize narration audio from text. Returns the saved audio path."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["text"],
                "properties": {
                    "text": { "type": "string", "description": "Narration to speak" },
                    "voice_id": { "type": "string", "description": "Optional voice override" }
                }
            }),
        }
    }

    async fn probe(&self) -> bsj_types::Result<()> {
        http::probe(&self.client, NAME, &self.base_url).await
    }

    async fn execute(&self, arguments: serde_json::Value) -> bsj_types::Result<String> {
        let text = http::required_str(&arguments, "text", NAME)?;
        let voice = arguments
            .get("voice_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.voice_id);

        tracing::debug!(tool = NAME, voice = %voice, chars = text.len(), "Synthesizing");
        let resp = self
            .client
            .post(format!("{}/v1/text-to-speech/{}", self.base_url, voice))
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/mpeg")
            .json(&json!({
                "text": text,
                "model_id": "eleven_multilingual_v2"
            }))
            .send()
            .await
            .map_err(|e| http::unreachable(NAME, e))?;
        let resp = http::check_status(NAME, resp).await?;
        let audio = resp.bytes().await.map_err(|e| http::unreachable(NAME, e))?;
        if audio.is_empty() {
            return Err(BsjError::ToolError {
                tool: NAME.into(),
                message: "empty audio response".into(),
            });
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self
            .output_dir
            .join(format!("voiceover-{}.mp3", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &audio).await?;
        Ok(json!({ "audio_path": path.display().to_string(), "voice_id": voice }).to_string())
    }
}
