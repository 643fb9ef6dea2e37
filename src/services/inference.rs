// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Face embedding extraction and conditioned image generation.
//!
//! Both models run in a GPU sidecar on the same instance; this module only
//! speaks its HTTP API. The traits let tests substitute deterministic fakes.

use crate::error::{AppError, Result};
use crate::models::Embedding;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generation can take minutes per image on a single GPU.
const GENERATION_TIMEOUT: Duration = Duration::from_secs(600);
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// One face found in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    pub bbox: [f32; 4],
}

#[async_trait]
pub trait FaceExtractor: Send + Sync {
    /// All faces detected in `image`, in detector order.
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>>;
}

/// Extract the embedding of the single face in `image`.
///
/// Zero faces is [`AppError::NoFace`]; more than one is
/// [`AppError::MultipleFaces`].
pub async fn extract_single_face(extractor: &dyn FaceExtractor, image: &[u8]) -> Result<Embedding> {
    let mut faces = extractor.detect_faces(image).await?;
    match faces.len() {
        0 => Err(AppError::NoFace),
        1 => {
            let face = faces.remove(0);
            Ok(Embedding {
                values: face.embedding,
                bbox: face.bbox,
            })
        }
        n => Err(AppError::MultipleFaces(n)),
    }
}

/// Parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub embedding: Vec<f32>,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    /// IP-Adapter influence of the face embedding
    pub ip_adapter_scale: f32,
    /// Structure scale
    pub s_scale: f32,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Base64 selfie, used by models that condition on face structure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_image: Option<String>,
}

impl GenerationRequest {
    /// Portrait defaults tuned for the IP-Adapter FaceID model.
    pub fn new(prompt: String, negative_prompt: String, embedding: Vec<f32>) -> Self {
        Self {
            prompt,
            negative_prompt,
            embedding,
            num_inference_steps: 30,
            guidance_scale: 5.5,
            ip_adapter_scale: 0.75,
            s_scale: 0.2,
            width: 512,
            height: 768,
            seed: None,
            face_image: None,
        }
    }

    pub fn with_face_image(mut self, image: &[u8]) -> Self {
        self.face_image = Some(BASE64.encode(image));
        self
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate a PNG image.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>>;
}

/// Client for the local inference sidecar.
#[derive(Clone)]
pub struct HttpInferenceClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct DetectRequest {
    image: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    /// Base64 PNG
    image: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Inference(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl FaceExtractor for HttpInferenceClient {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        let response = self
            .http
            .post(format!("{}/v1/faces", self.base_url))
            .timeout(EXTRACTION_TIMEOUT)
            .json(&DetectRequest {
                image: BASE64.encode(image),
            })
            .send()
            .await
            .map_err(|e| AppError::Inference(e.to_string()))?;

        let response = Self::check_response(response).await?;
        let detected: DetectResponse = response
            .json()
            .await
            .map_err(|e| AppError::Inference(format!("JSON parse error: {}", e)))?;

        tracing::debug!(faces = detected.faces.len(), "Face detection complete");
        Ok(detected.faces)
    }
}

#[async_trait]
impl ImageGenerator for HttpInferenceClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/v1/generate", self.base_url))
            .timeout(GENERATION_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::Inference(e.to_string()))?;

        let response = Self::check_response(response).await?;
        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Inference(format!("JSON parse error: {}", e)))?;

        BASE64
            .decode(generated.image.as_bytes())
            .map_err(|e| AppError::Inference(format!("Invalid image payload: {}", e)))
    }
}
