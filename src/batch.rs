// 该文件是 Wanglou （望楼） 项目的一部分。
// src/batch.rs - 目录批处理驱动
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

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::oracle::{DetectionSet, Oracle, OracleError, Prompt};
use crate::render::{self, RenderError, Renderer};
use crate::source::{self, SourceError};

pub const DEFAULT_OUTPUT_PREFIX: &str = "detected_";

/// 单个条目处理中可能出现的可恢复错误。
///
/// 模型初始化失败不在此列：它在进程启动时就应失败，
/// 批处理开始后不会再出现。
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error(transparent)]
  Source(#[from] SourceError),
  #[error(transparent)]
  Oracle(#[from] OracleError),
  #[error(transparent)]
  Render(#[from] RenderError),
}

impl PipelineError {
  /// 报告中使用的稳定错误类别名
  pub fn kind(&self) -> &'static str {
    match self {
      PipelineError::Source(SourceError::Unavailable(_)) => "SourceUnavailable",
      PipelineError::Source(SourceError::Decode(_)) => "DecodeError",
      PipelineError::Oracle(OracleError::Unavailable(_)) => "OracleUnavailable",
      PipelineError::Oracle(OracleError::Inference(_)) => "InferenceError",
      PipelineError::Render(_) => "RenderError",
    }
  }
}

#[derive(Error, Debug)]
pub enum BatchError {
  #[error("无法读取输入目录 {}: {}", .0.display(), .1)]
  ListInput(PathBuf, std::io::Error),
  #[error("无法创建输出目录 {}: {}", .0.display(), .1)]
  CreateOutput(PathBuf, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
  /// 所有条目处理完毕（无论单项成败）
  Completed,
  /// 输入目录没有匹配的文件，不算错误
  NothingToProcess,
}

#[derive(Debug)]
pub enum ItemOutcome {
  Succeeded {
    detections: usize,
    labels: Vec<String>,
    output: PathBuf,
  },
  Failed {
    kind: &'static str,
    message: String,
  },
}

#[derive(Debug)]
pub struct ItemReport {
  pub filename: String,
  pub outcome: ItemOutcome,
}

#[derive(Debug)]
pub struct BatchReport {
  pub status: BatchStatus,
  pub items: Vec<ItemReport>,
}

impl BatchReport {
  pub fn succeeded(&self) -> usize {
    self
      .items
      .iter()
      .filter(|item| matches!(item.outcome, ItemOutcome::Succeeded { .. }))
      .count()
  }

  pub fn failed(&self) -> usize {
    self.items.len() - self.succeeded()
  }
}

/// 目录批处理驱动。
///
/// 严格串行处理：先按文件名字典序枚举，再逐个
/// 读取、推理、绘制、落盘。单个条目的失败被隔离为
/// 该条目的结果，绝不中止整批。
pub struct BatchRunner {
  prompt: Prompt,
  threshold: f32,
  extension: String,
  prefix: String,
}

impl BatchRunner {
  /// `extension` 为本次运行唯一匹配的图像扩展名（大小写不敏感）
  pub fn new(prompt: Prompt, threshold: f32, extension: &str) -> Self {
    BatchRunner {
      prompt,
      threshold,
      extension: extension.trim_start_matches('.').to_lowercase(),
      prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
    }
  }

  pub fn extension(&self) -> &str {
    &self.extension
  }

  /// 枚举输入目录中扩展名匹配的常规文件，按文件名字典序排序
  fn matching_files(&self, input_dir: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let entries =
      fs::read_dir(input_dir).map_err(|e| BatchError::ListInput(input_dir.to_path_buf(), e))?;

    let mut files = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| BatchError::ListInput(input_dir.to_path_buf(), e))?;
      let path = entry.path();
      if !path.is_file() {
        continue;
      }
      let matched = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
        .unwrap_or(false);
      if matched {
        files.push(path);
      }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
  }

  /// 处理整个目录并返回汇总报告。
  ///
  /// 输出目录在第一次写入前创建（含缺失的父目录，已存在
  /// 时安全）；输入目录为空时立即返回空报告，不创建输出。
  pub fn run(
    &self,
    oracle: &dyn Oracle,
    renderer: &Renderer,
    input_dir: &Path,
    output_dir: &Path,
  ) -> Result<BatchReport, BatchError> {
    let files = self.matching_files(input_dir)?;

    if files.is_empty() {
      info!("输入目录没有匹配的 {} 文件: {}", self.extension, input_dir.display());
      return Ok(BatchReport {
        status: BatchStatus::NothingToProcess,
        items: Vec::new(),
      });
    }

    fs::create_dir_all(output_dir)
      .map_err(|e| BatchError::CreateOutput(output_dir.to_path_buf(), e))?;

    let total = files.len();
    let mut items = Vec::with_capacity(total);

    for (idx, path) in files.iter().enumerate() {
      let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
      println!("[{}/{}] Processing: {}", idx + 1, total, filename);

      let output_path = output_dir.join(format!("{}{}", self.prefix, filename));
      let outcome = match self.process_item(oracle, renderer, path, &output_path) {
        Ok(detections) => {
          println!("Detected {} object(s):", detections.len());
          for line in render::detection_lines(&detections) {
            println!("{}", line);
          }
          ItemOutcome::Succeeded {
            detections: detections.len(),
            labels: detections.iter().map(|det| det.label.clone()).collect(),
            output: output_path,
          }
        }
        Err(err) => {
          error!("处理 {} 失败: {}", filename, err);
          println!("Error processing {}: {}", filename, err);
          ItemOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
          }
        }
      };

      items.push(ItemReport { filename, outcome });
    }

    Ok(BatchReport {
      status: BatchStatus::Completed,
      items,
    })
  }

  /// 单条目流水线：读取、推理、绘制、落盘。
  /// 绘制完全在内存中完成，落盘是最后一步，失败的条目
  /// 不会留下残缺的输出文件。
  fn process_item(
    &self,
    oracle: &dyn Oracle,
    renderer: &Renderer,
    input: &Path,
    output: &Path,
  ) -> Result<DetectionSet, PipelineError> {
    let mut image = source::load(&input.to_string_lossy())?;
    let detections = oracle.detect(&image, &self.prompt, self.threshold)?;
    renderer.draw(&mut image, &detections);
    renderer.persist(&image, output)?;
    Ok(detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::oracle::Detection;
  use image::RgbImage;

  struct MockOracle {
    detections: Vec<Detection>,
  }

  impl Oracle for MockOracle {
    fn detect(
      &self,
      _image: &RgbImage,
      _prompt: &Prompt,
      threshold: f32,
    ) -> Result<DetectionSet, OracleError> {
      let kept: Vec<Detection> = self
        .detections
        .iter()
        .filter(|det| det.score >= threshold)
        .cloned()
        .collect();
      Ok(kept.into())
    }
  }

  fn mock_oracle() -> MockOracle {
    MockOracle {
      detections: vec![Detection {
        x1: 1.0,
        y1: 1.0,
        x2: 5.0,
        y2: 5.0,
        score: 0.9,
        label: "building".into(),
      }],
    }
  }

  fn runner() -> BatchRunner {
    BatchRunner::new(Prompt::parse("building").unwrap(), 0.3, "png")
  }

  fn write_png(dir: &Path, name: &str) {
    RgbImage::new(8, 8).save(dir.join(name)).unwrap();
  }

  #[test]
  fn empty_directory_is_nothing_to_process() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");

    let report = runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    assert_eq!(report.status, BatchStatus::NothingToProcess);
    assert!(report.items.is_empty());
    // 没有任何条目时不创建输出目录，也不写任何文件
    assert!(!output.exists());
  }

  #[test]
  fn corrupt_image_is_isolated() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "a.png");
    write_png(input.path(), "b.png");
    write_png(input.path(), "c.png");
    std::fs::write(input.path().join("broken.png"), b"not an image").unwrap();
    std::fs::write(input.path().join("note.txt"), b"ignored").unwrap();

    let report = runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.items.len(), 4);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);

    let failed = report
      .items
      .iter()
      .find(|item| matches!(item.outcome, ItemOutcome::Failed { .. }))
      .unwrap();
    assert_eq!(failed.filename, "broken.png");
    match &failed.outcome {
      ItemOutcome::Failed { kind, .. } => assert_eq!(*kind, "DecodeError"),
      _ => unreachable!(),
    }

    // 失败的条目不留输出文件
    let written: Vec<_> = std::fs::read_dir(&output)
      .unwrap()
      .map(|entry| entry.unwrap().file_name().into_string().unwrap())
      .collect();
    assert_eq!(written.len(), 3);
    assert!(written.iter().all(|name| name.starts_with("detected_")));
    assert!(!written.contains(&"detected_broken.png".to_string()));
  }

  #[test]
  fn items_are_processed_in_lexicographic_order() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "c.png");
    write_png(input.path(), "a.png");
    write_png(input.path(), "b.png");

    let report = runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    let names: Vec<_> = report.items.iter().map(|item| item.filename.as_str()).collect();
    assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
  }

  #[test]
  fn derived_filenames_use_prefix() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "tower.png");

    runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    assert!(output.join("detected_tower.png").exists());
  }

  #[test]
  fn extension_match_is_case_insensitive() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "UPPER.PNG");

    let report = runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    assert_eq!(report.succeeded(), 1);
  }

  #[test]
  fn rerun_overwrites_without_accumulating() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "a.png");
    write_png(input.path(), "b.png");

    let batch = runner();
    let oracle = mock_oracle();
    let renderer = Renderer::new();
    batch.run(&oracle, &renderer, input.path(), &output).unwrap();
    batch.run(&oracle, &renderer, input.path(), &output).unwrap();

    let count = std::fs::read_dir(&output).unwrap().count();
    assert_eq!(count, 2);
  }

  #[test]
  fn success_report_carries_labels() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "a.png");

    let report = runner()
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    match &report.items[0].outcome {
      ItemOutcome::Succeeded {
        detections, labels, ..
      } => {
        assert_eq!(*detections, 1);
        assert_eq!(labels, &vec!["building".to_string()]);
      }
      _ => unreachable!(),
    }
  }

  #[test]
  fn threshold_above_scores_yields_empty_success() {
    let input = tempfile::tempdir().unwrap();
    let output = input.path().join("out");
    write_png(input.path(), "a.png");

    let batch = BatchRunner::new(Prompt::parse("building").unwrap(), 0.95, "png");
    let report = batch
      .run(&mock_oracle(), &Renderer::new(), input.path(), &output)
      .unwrap();

    match &report.items[0].outcome {
      ItemOutcome::Succeeded { detections, .. } => assert_eq!(*detections, 0),
      _ => unreachable!(),
    }
  }
}
