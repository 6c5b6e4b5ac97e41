// 该文件是 Wanglou （望楼） 项目的一部分。
// src/oracle/grounding.rs - 零样本开放词表检测模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::borrow::Cow;
use std::path::Path;
use std::sync::Mutex;

use image::RgbImage;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::logging::LogLevel;
use ort::session::{Session, SessionInputs};
use ort::value::TensorRef;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::oracle::{Detection, DetectionSet, Oracle, OracleError, Prompt};

const GROUNDING_MODEL_FILE: &str = "model.onnx";
const GROUNDING_TOKENIZER_FILE: &str = "tokenizer.json";
const GROUNDING_INPUT_SIZE: u32 = 800;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 零样本文本提示检测模型。
///
/// 从模型目录加载一次 ONNX 会话与分词器，此后作为进程级
/// 只读资源供所有 `detect` 调用共享。
pub struct GroundingOracle {
  session: Mutex<Session>,
  tokenizer: Tokenizer,
  input_size: u32,
}

/// 短语在查询 token 序列中的位置，用于把检测映射回类别标签
pub(crate) struct PhraseSpan {
  pub(crate) start: usize,
  pub(crate) end: usize,
  pub(crate) phrase: String,
}

struct TextEncoding {
  ids: Vec<i64>,
  attention: Vec<i64>,
  type_ids: Vec<i64>,
  spans: Vec<PhraseSpan>,
}

impl GroundingOracle {
  /// 从模型目录加载 `model.onnx` 与 `tokenizer.json`
  pub fn new(model_dir: impl AsRef<Path>) -> Result<Self, OracleError> {
    let model_dir = model_dir.as_ref();
    let model_path = model_dir.join(GROUNDING_MODEL_FILE);

    info!("加载模型文件: {}", model_path.display());
    let session = Session::builder()
      .and_then(|builder| Ok(builder.with_log_level(LogLevel::Error)?))
      .and_then(|mut builder| builder.commit_from_file(&model_path))
      .map_err(|e| {
        OracleError::Unavailable(format!("无法加载模型 {}: {}", model_path.display(), e))
      })?;
    info!("模型加载完成");

    let tokenizer_path = model_dir.join(GROUNDING_TOKENIZER_FILE);
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
      OracleError::Unavailable(format!(
        "无法加载分词器 {}: {}",
        tokenizer_path.display(),
        e
      ))
    })?;

    Ok(GroundingOracle {
      session: Mutex::new(session),
      tokenizer,
      input_size: GROUNDING_INPUT_SIZE,
    })
  }

  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  /// 缩放到网络输入尺寸并做 ImageNet 归一化，NCHW f32
  fn encode_image(&self, image: &RgbImage) -> Array4<f32> {
    let size = self.input_size;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..3 {
        tensor[[0, c, y as usize, x as usize]] =
          (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
      }
    }
    tensor
  }

  /// 把提示词编码为模型的文本输入，并记录每个短语的 token 跨度
  fn encode_prompt(&self, prompt: &Prompt) -> Result<TextEncoding, OracleError> {
    let query = prompt.as_query();
    debug!("提示词查询串: {}", query);

    let encoding = self
      .tokenizer
      .encode(query.as_str(), true)
      .map_err(|e| OracleError::Inference(format!("分词失败: {}", e)))?;

    let raw_ids = encoding.get_ids();
    let ids: Vec<i64> = raw_ids.iter().map(|&v| v as i64).collect();
    let attention: Vec<i64> = encoding
      .get_attention_mask()
      .iter()
      .map(|&v| v as i64)
      .collect();
    let type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&v| v as i64).collect();

    let mut spans = Vec::with_capacity(prompt.phrases().len());
    let mut cursor = 0usize;
    for phrase in prompt.phrases() {
      let piece = self
        .tokenizer
        .encode(phrase.as_str(), false)
        .map_err(|e| OracleError::Inference(format!("分词失败: {}", e)))?;
      let needle = piece.get_ids();
      if needle.is_empty() {
        continue;
      }
      match find_subsequence(&raw_ids[cursor..], needle) {
        Some(offset) => {
          let start = cursor + offset;
          let end = start + needle.len();
          spans.push(PhraseSpan {
            start,
            end,
            phrase: phrase.clone(),
          });
          cursor = end;
        }
        None => {
          warn!("未能在查询序列中定位短语 '{}'", phrase);
        }
      }
    }

    Ok(TextEncoding {
      ids,
      attention,
      type_ids,
      spans,
    })
  }
}

impl Oracle for GroundingOracle {
  fn detect(
    &self,
    image: &RgbImage,
    prompt: &Prompt,
    threshold: f32,
  ) -> Result<DetectionSet, OracleError> {
    // 编码时记录原图宽高，后处理的反归一化必须使用它们
    let original_width = image.width();
    let original_height = image.height();

    let pixels = self.encode_image(image);
    let text = self.encode_prompt(prompt)?;

    let pixel_dims: Vec<i64> = pixels.shape().iter().map(|&d| d as i64).collect();
    let pixel_data = pixels
      .as_slice()
      .ok_or_else(|| OracleError::Inference("图像张量内存不连续".into()))?;
    let text_dims = vec![1i64, text.ids.len() as i64];

    let mut session = self
      .session
      .lock()
      .map_err(|_| OracleError::Inference("推理会话锁被污染".into()))?;

    debug!("执行模型推理");
    let inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(vec![
      (
        Cow::Borrowed("pixel_values"),
        TensorRef::from_array_view((pixel_dims, pixel_data))
          .map_err(|e| OracleError::Inference(e.to_string()))?
          .into(),
      ),
      (
        Cow::Borrowed("input_ids"),
        TensorRef::from_array_view((text_dims.clone(), text.ids.as_slice()))
          .map_err(|e| OracleError::Inference(e.to_string()))?
          .into(),
      ),
      (
        Cow::Borrowed("attention_mask"),
        TensorRef::from_array_view((text_dims.clone(), text.attention.as_slice()))
          .map_err(|e| OracleError::Inference(e.to_string()))?
          .into(),
      ),
      (
        Cow::Borrowed("token_type_ids"),
        TensorRef::from_array_view((text_dims, text.type_ids.as_slice()))
          .map_err(|e| OracleError::Inference(e.to_string()))?
          .into(),
      ),
    ]);
    let outputs = session
      .run(inputs)
      .map_err(|e| OracleError::Inference(e.to_string()))?;

    let logits_value = outputs
      .get("logits")
      .ok_or_else(|| OracleError::Inference("模型输出缺少 logits".into()))?;
    let (logits_shape, logits_data) = logits_value
      .try_extract_tensor::<f32>()
      .map_err(|e| OracleError::Inference(e.to_string()))?;
    let logits_dims: Vec<i64> = logits_shape.iter().copied().collect();

    let boxes_value = outputs
      .get("pred_boxes")
      .ok_or_else(|| OracleError::Inference("模型输出缺少 pred_boxes".into()))?;
    let (boxes_shape, boxes_data) = boxes_value
      .try_extract_tensor::<f32>()
      .map_err(|e| OracleError::Inference(e.to_string()))?;
    let boxes_dims: Vec<i64> = boxes_shape.iter().copied().collect();

    if logits_dims.len() != 3 || boxes_dims.len() != 3 || boxes_dims[2] != 4 {
      return Err(OracleError::Inference(format!(
        "模型输出形状异常: logits {:?}, pred_boxes {:?}",
        logits_dims, boxes_dims
      )));
    }

    let num_queries = logits_dims[1] as usize;
    let seq_len = logits_dims[2] as usize;

    let items = decode_predictions(
      logits_data,
      boxes_data,
      num_queries,
      seq_len,
      &text.spans,
      threshold,
      original_width,
      original_height,
    );
    debug!("检测到 {} 个物体", items.len());

    Ok(items.into())
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

fn find_subsequence(haystack: &[u32], needle: &[u32]) -> Option<usize> {
  if needle.is_empty() || haystack.len() < needle.len() {
    return None;
  }
  haystack.windows(needle.len()).position(|w| w == needle)
}

/// 把原始模型输出解码为像素坐标的检测集。
///
/// 每个查询的得分取其短语 token 上 sigmoid 后的最大值，标签取
/// 得分最高的短语。阈值为闭边界：得分恰好等于阈值时保留。
/// 边界框为归一化 cxcywh，反归一化用编码时记录的原图宽高，
/// 而不是缩放后的工作副本，否则所有下游坐标都会错比例。
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_predictions(
  logits: &[f32],
  boxes: &[f32],
  num_queries: usize,
  seq_len: usize,
  spans: &[PhraseSpan],
  threshold: f32,
  original_width: u32,
  original_height: u32,
) -> Vec<Detection> {
  let w = original_width as f32;
  let h = original_height as f32;
  let mut items = Vec::new();

  for q in 0..num_queries {
    let row = &logits[q * seq_len..(q + 1) * seq_len];

    let mut score = f32::MIN;
    let mut label: Option<&str> = None;
    for span in spans {
      for pos in span.start..span.end.min(seq_len) {
        let s = sigmoid(row[pos]);
        if s > score {
          score = s;
          label = Some(&span.phrase);
        }
      }
    }
    let Some(label) = label else {
      continue;
    };

    if score < threshold {
      continue;
    }

    let cx = boxes[q * 4] * w;
    let cy = boxes[q * 4 + 1] * h;
    let bw = boxes[q * 4 + 2] * w;
    let bh = boxes[q * 4 + 3] * h;

    let x1 = (cx - bw / 2.0).clamp(0.0, w);
    let y1 = (cy - bh / 2.0).clamp(0.0, h);
    let x2 = (cx + bw / 2.0).clamp(0.0, w);
    let y2 = (cy + bh / 2.0).clamp(0.0, h);

    if x2 <= x1 || y2 <= y1 {
      continue;
    }

    items.push(Detection {
      x1,
      y1,
      x2,
      y2,
      score,
      label: label.to_string(),
    });
  }

  items
}
