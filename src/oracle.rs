// 该文件是 Wanglou （望楼） 项目的一部分。
// src/oracle.rs - 检测模型
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

use std::str::FromStr;

use image::RgbImage;
use thiserror::Error;

mod grounding;
mod yolo;

pub use self::grounding::GroundingOracle;
pub use self::yolo::{COCO_CLASSES, YoloOracle};

#[derive(Error, Debug)]
pub enum OracleError {
  /// 模型或分词器无法初始化；进程启动时即失败，没有按次调用的回退
  #[error("模型初始化失败: {0}")]
  Unavailable(String),
  /// 单次推理调用失败；由调用方按图像隔离，不中止批处理
  #[error("推理调用失败: {0}")]
  Inference(String),
}

#[derive(Error, Debug)]
pub enum PromptError {
  #[error("提示词为空")]
  Empty,
}

/// 提示词：一个或多个自由文本类别短语。
///
/// 多个短语在单字符串接口里以句点分隔，例如
/// `"building . house . skyscraper"`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
  phrases: Vec<String>,
}

impl Prompt {
  /// 按句点拆分短语，去除空白并统一小写
  pub fn parse(text: &str) -> Result<Self, PromptError> {
    let phrases: Vec<String> = text
      .split('.')
      .map(|p| p.trim().to_lowercase())
      .filter(|p| !p.is_empty())
      .collect();

    if phrases.is_empty() {
      return Err(PromptError::Empty);
    }

    Ok(Prompt { phrases })
  }

  pub fn phrases(&self) -> &[String] {
    &self.phrases
  }

  /// 重新拼接为模型的单字符串查询，短语间以 ` . ` 分隔并以句点收尾
  pub fn as_query(&self) -> String {
    format!("{} .", self.phrases.join(" . "))
  }
}

impl FromStr for Prompt {
  type Err = PromptError;

  fn from_str(text: &str) -> Result<Self, Self::Err> {
    Prompt::parse(text)
  }
}

impl std::fmt::Display for Prompt {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.phrases.join(" . "))
  }
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// 边界框左上角 x 坐标（原图像素）
  pub x1: f32,
  /// 边界框左上角 y 坐标（原图像素）
  pub y1: f32,
  /// 边界框右下角 x 坐标（原图像素）
  pub x2: f32,
  /// 边界框右下角 y 坐标（原图像素）
  pub y2: f32,
  /// 置信度，范围 [0, 1]
  pub score: f32,
  /// 类别标签，取自提示词的类别词表
  pub label: String,
}

/// 一张图像的全部检测结果
#[derive(Debug, Clone, Default)]
pub struct DetectionSet {
  pub items: Box<[Detection]>,
}

impl DetectionSet {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }
}

impl From<Vec<Detection>> for DetectionSet {
  fn from(items: Vec<Detection>) -> Self {
    DetectionSet {
      items: items.into_boxed_slice(),
    }
  }
}

/// 检测模型的能力边界。
///
/// 对固定的权重，相同的（图像、提示词、阈值）三元组必须产生
/// 相同的结果集；任何得分低于阈值的候选都不会被返回，
/// 得分恰好等于阈值的候选被保留。
pub trait Oracle {
  fn detect(
    &self,
    image: &RgbImage,
    prompt: &Prompt,
    threshold: f32,
  ) -> Result<DetectionSet, OracleError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prompt_splits_on_periods() {
    let prompt = Prompt::parse("building . house . skyscraper").unwrap();
    assert_eq!(prompt.phrases(), &["building", "house", "skyscraper"]);
  }

  #[test]
  fn prompt_trims_and_lowercases() {
    let prompt = Prompt::parse("  Building.HOUSE .").unwrap();
    assert_eq!(prompt.phrases(), &["building", "house"]);
  }

  #[test]
  fn prompt_single_phrase() {
    let prompt = Prompt::parse("building").unwrap();
    assert_eq!(prompt.phrases(), &["building"]);
    assert_eq!(prompt.as_query(), "building .");
  }

  #[test]
  fn prompt_query_joins_with_periods() {
    let prompt = Prompt::parse("building . house").unwrap();
    assert_eq!(prompt.as_query(), "building . house .");
  }

  #[test]
  fn empty_prompt_is_rejected() {
    assert!(matches!(Prompt::parse(""), Err(PromptError::Empty)));
    assert!(matches!(Prompt::parse(" . . "), Err(PromptError::Empty)));
  }

  #[test]
  fn prompt_from_str_for_cli() {
    let prompt: Prompt = "building . house".parse().unwrap();
    assert_eq!(prompt.phrases().len(), 2);
  }

  #[test]
  fn detection_set_helpers() {
    let set = DetectionSet::default();
    assert!(set.is_empty());

    let set: DetectionSet = vec![Detection {
      x1: 0.0,
      y1: 0.0,
      x2: 1.0,
      y2: 1.0,
      score: 0.5,
      label: "building".into(),
    }]
    .into();
    assert_eq!(set.len(), 1);
  }
}
