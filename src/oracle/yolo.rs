// 该文件是 Wanglou （望楼） 项目的一部分。
// src/oracle/yolo.rs - YOLO 目标检测模型
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

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::logging::LogLevel;
use ort::session::{Session, SessionInputs};
use ort::value::TensorRef;
use tracing::{debug, info, warn};

use crate::oracle::{Detection, DetectionSet, Oracle, OracleError, Prompt};

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

const YOLO_BOX_FIELDS: usize = 4;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
const LETTERBOX_FILL: u8 = 114;

/// 外部权重的 YOLO 检测模型。
///
/// 词表固定为 COCO 的 80 类，`detect` 的提示词参数被忽略。
pub struct YoloOracle {
  session: Mutex<Session>,
  input_name: String,
  output_name: String,
  input_size: u32,
  nms_threshold: f32,
}

/// 等比缩放加灰边填充的参数，用于把检测框映射回原图
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
  pub(crate) scale: f32,
  pub(crate) pad_x: f32,
  pub(crate) pad_y: f32,
}

impl YoloOracle {
  /// 从权重文件路径加载模型。
  ///
  /// `device` 为 `None` 或 `"cpu"` 时使用 CPU；启用 `cuda`
  /// 特性后可传入 CUDA 设备序号。
  pub fn new(
    model_path: impl AsRef<Path>,
    input_size: u32,
    device: Option<&str>,
  ) -> Result<Self, OracleError> {
    let model_path = model_path.as_ref();

    info!("加载模型文件: {}", model_path.display());
    let session = build_session(model_path, device)?;
    info!("模型加载完成");

    let input_name = session
      .inputs()
      .first()
      .map(|input| input.name().to_string())
      .ok_or_else(|| OracleError::Unavailable("模型没有输入张量".into()))?;
    let output_name = session
      .outputs()
      .first()
      .map(|output| output.name().to_string())
      .ok_or_else(|| OracleError::Unavailable("模型没有输出张量".into()))?;
    debug!("模型输入: {}, 输出: {}", input_name, output_name);

    Ok(YoloOracle {
      session: Mutex::new(session),
      input_name,
      output_name,
      input_size,
      nms_threshold: YOLO_NMS_THRESHOLD,
    })
  }

  pub fn with_nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  /// 等比缩放到网络输入尺寸，灰边填充，NHWC -> NCHW f32
  fn encode_image(&self, image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = self.input_size;
    let lb = letterbox_params(image.width(), image.height(), size);

    let scaled_w = ((image.width() as f32 * lb.scale).round() as u32).max(1);
    let scaled_h = ((image.height() as f32 * lb.scale).round() as u32).max(1);
    let resized = image::imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    image::imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in canvas.enumerate_pixels() {
      for c in 0..3 {
        tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
      }
    }
    (tensor, lb)
  }
}

impl Oracle for YoloOracle {
  fn detect(
    &self,
    image: &RgbImage,
    _prompt: &Prompt,
    threshold: f32,
  ) -> Result<DetectionSet, OracleError> {
    self.infer(image, threshold)
  }
}

impl YoloOracle {
  /// 运行推理。词表固定，不需要提示词。
  pub fn infer(&self, image: &RgbImage, threshold: f32) -> Result<DetectionSet, OracleError> {
    let original_width = image.width();
    let original_height = image.height();

    let (tensor, lb) = self.encode_image(image);
    let dims: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
    let data = tensor
      .as_slice()
      .ok_or_else(|| OracleError::Inference("图像张量内存不连续".into()))?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| OracleError::Inference("推理会话锁被污染".into()))?;

    debug!("执行模型推理");
    let inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(vec![(
      Cow::Borrowed(self.input_name.as_str()),
      TensorRef::from_array_view((dims, data))
        .map_err(|e| OracleError::Inference(e.to_string()))?
        .into(),
    )]);
    let outputs = session
      .run(inputs)
      .map_err(|e| OracleError::Inference(e.to_string()))?;

    let value = outputs
      .get(self.output_name.as_str())
      .ok_or_else(|| OracleError::Inference(format!("模型输出缺少 {}", self.output_name)))?;
    let (shape, data) = value
      .try_extract_tensor::<f32>()
      .map_err(|e| OracleError::Inference(e.to_string()))?;
    let dims: Vec<i64> = shape.iter().copied().collect();

    // 输出格式: [batch, 4 + 类别数, 候选框数]
    if dims.len() != 3 || (dims[1] as usize) <= YOLO_BOX_FIELDS {
      return Err(OracleError::Inference(format!(
        "模型输出形状异常: {:?}",
        dims
      )));
    }
    let num_classes = dims[1] as usize - YOLO_BOX_FIELDS;
    let anchors = dims[2] as usize;

    let items = decode_boxes(
      data,
      num_classes,
      anchors,
      threshold,
      &lb,
      original_width,
      original_height,
      &COCO_CLASSES,
    );
    let items = nms(items, self.nms_threshold);
    debug!("检测到 {} 个物体", items.len());

    Ok(items.into())
  }
}

fn build_session(model_path: &Path, device: Option<&str>) -> Result<Session, OracleError> {
  let mut builder = Session::builder()
    .and_then(|builder| Ok(builder.with_log_level(LogLevel::Error)?))
    .map_err(|e| OracleError::Unavailable(e.to_string()))?;

  #[cfg(feature = "cuda")]
  let builder = match device {
    Some(device) if device != "cpu" => {
      use ort::execution_providers::CUDAExecutionProvider;
      let device_id: i32 = device
        .parse()
        .map_err(|_| OracleError::Unavailable(format!("无法解析设备选择: {}", device)))?;
      builder
        .with_execution_providers([CUDAExecutionProvider::default()
          .with_device_id(device_id)
          .build()])
        .map_err(|e| OracleError::Unavailable(e.to_string()))?
    }
    _ => builder,
  };
  #[cfg(not(feature = "cuda"))]
  if device.is_some_and(|device| device != "cpu") {
    warn!("未启用 cuda 特性，设备选择被忽略，回退到 CPU");
  }

  builder.commit_from_file(model_path).map_err(|e| {
    OracleError::Unavailable(format!("无法加载模型 {}: {}", model_path.display(), e))
  })
}

pub(crate) fn letterbox_params(width: u32, height: u32, input_size: u32) -> Letterbox {
  let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
  let pad_x = (input_size as f32 - width as f32 * scale) / 2.0;
  let pad_y = (input_size as f32 - height as f32 * scale) / 2.0;
  Letterbox {
    scale,
    pad_x,
    pad_y,
  }
}

/// 解码 YOLO 输出，按阈值过滤并映射回原图像素坐标。
///
/// 阈值为闭边界：得分恰好等于阈值时保留。坐标先去掉灰边
/// 填充再除以缩放比例，回到原图空间后夹取到图像范围内。
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_boxes(
  data: &[f32],
  num_classes: usize,
  anchors: usize,
  threshold: f32,
  lb: &Letterbox,
  original_width: u32,
  original_height: u32,
  labels: &[&str],
) -> Vec<Detection> {
  let w = original_width as f32;
  let h = original_height as f32;
  let mut items = Vec::new();

  for anchor in 0..anchors {
    // 找到最高类别分数
    let mut score = f32::MIN;
    let mut class_id = 0usize;
    for class in 0..num_classes {
      let s = data[(YOLO_BOX_FIELDS + class) * anchors + anchor];
      if s > score {
        score = s;
        class_id = class;
      }
    }

    if score < threshold {
      continue;
    }

    let cx = data[anchor];
    let cy = data[anchors + anchor];
    let bw = data[2 * anchors + anchor];
    let bh = data[3 * anchors + anchor];

    let x1 = (((cx - bw / 2.0) - lb.pad_x) / lb.scale).clamp(0.0, w);
    let y1 = (((cy - bh / 2.0) - lb.pad_y) / lb.scale).clamp(0.0, h);
    let x2 = (((cx + bw / 2.0) - lb.pad_x) / lb.scale).clamp(0.0, w);
    let y2 = (((cy + bh / 2.0) - lb.pad_y) / lb.scale).clamp(0.0, h);

    if x2 <= x1 || y2 <= y1 {
      continue;
    }

    items.push(Detection {
      x1,
      y1,
      x2,
      y2,
      score,
      label: labels.get(class_id).unwrap_or(&"unknown").to_string(),
    });
  }

  items
}

/// 非极大值抑制
pub(crate) fn nms(mut detections: Vec<Detection>, nms_threshold: f32) -> Vec<Detection> {
  // 按置信度降序排序
  detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());

  let mut result = Vec::new();

  while !detections.is_empty() {
    let best = detections.remove(0);

    detections.retain(|det| {
      if det.label != best.label {
        return true;
      }
      iou(&best, det) < nms_threshold
    });

    result.push(best);
  }

  result
}

/// 计算两个边界框的 IoU
fn iou(a: &Detection, b: &Detection) -> f32 {
  let x1 = a.x1.max(b.x1);
  let y1 = a.y1.max(b.y1);
  let x2 = a.x2.min(b.x2);
  let y2 = a.y2.min(b.y2);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
  let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}
