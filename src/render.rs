// 该文件是 Wanglou （望楼） 项目的一部分。
// src/render.rs - 检测结果可视化与落盘
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::debug;

use crate::oracle::DetectionSet;

const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_OFFSET: i32 = 20;
const PALETTE_SIZE: usize = 80;

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
}

/// 可视化工具
pub struct Renderer {
  /// 字体
  font: FontArc,
  /// 字体大小
  font_scale: PxScale,
  /// 边界框颜色映射
  colors: Vec<Rgb<u8>>,
}

impl Default for Renderer {
  fn default() -> Self {
    Self::new()
  }
}

impl Renderer {
  /// 创建一个新的可视化工具
  pub fn new() -> Self {
    // 使用内置的默认字体数据
    let font_data = include_bytes!("../assets/DejaVuSans.ttf");
    let font = FontArc::try_from_slice(font_data).expect("无法加载字体");

    // 生成一组不同的颜色，按标签哈希取色
    let colors: Vec<Rgb<u8>> = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        Self::hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }

  /// HSV 转 RGB
  fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
      (c, x, 0.0)
    } else if h < 120.0 {
      (x, c, 0.0)
    } else if h < 180.0 {
      (0.0, c, x)
    } else if h < 240.0 {
      (0.0, x, c)
    } else if h < 300.0 {
      (x, 0.0, c)
    } else {
      (c, 0.0, x)
    };

    Rgb([
      ((r + m) * 255.0) as u8,
      ((g + m) * 255.0) as u8,
      ((b + m) * 255.0) as u8,
    ])
  }

  /// 同一标签总是映射到同一颜色
  fn label_color(&self, label: &str) -> Rgb<u8> {
    let hash: usize = label.bytes().map(|b| b as usize).sum();
    self.colors[hash % self.colors.len()]
  }

  /// 在图像上绘制检测结果
  pub fn draw(&self, image: &mut RgbImage, detections: &DetectionSet) {
    for detection in detections.iter() {
      let color = self.label_color(&detection.label);

      // 绘制边界框
      let x = detection.x1.max(0.0) as i32;
      let y = detection.y1.max(0.0) as i32;
      let width = (detection.x2 - detection.x1).min(image.width() as f32 - detection.x1) as u32;
      let height = (detection.y2 - detection.y1).min(image.height() as f32 - detection.y1) as u32;

      if width > 0 && height > 0 {
        let rect = Rect::at(x, y).of_size(width, height);
        draw_hollow_rect_mut(image, rect, color);

        // 绘制第二个边框以增加可见度
        if x > 0 && y > 0 {
          let inner_rect =
            Rect::at(x + 1, y + 1).of_size(width.saturating_sub(2), height.saturating_sub(2));
          draw_hollow_rect_mut(image, inner_rect, color);
        }
      }

      // 标签文本锚在框的左上角上方，避免压住框内区域
      let label = format!("{}: {:.2}", detection.label, detection.score);
      let text_y = (y - LABEL_TEXT_OFFSET).max(0);

      draw_text_mut(image, color, x, text_y, self.font_scale, &self.font, &label);
    }
  }

  /// 保存标注后的图像，必要时创建缺失的父目录
  pub fn persist(&self, image: &RgbImage, path: impl AsRef<Path>) -> Result<(), RenderError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(path)?;
    debug!("保存图像到文件: {}", path.display());

    Ok(())
  }
}

/// 逐条检测结果的文本行，批处理汇总也由它构成。
///
/// 格式: `  1. building - Confidence: 0.873 - Box: [10.0, 20.0, 110.0, 220.0]`
pub fn detection_lines(detections: &DetectionSet) -> Vec<String> {
  detections
    .iter()
    .enumerate()
    .map(|(idx, det)| {
      format!(
        "  {}. {} - Confidence: {:.3} - Box: [{:.1}, {:.1}, {:.1}, {:.1}]",
        idx + 1,
        det.label,
        det.score,
        det.x1,
        det.y1,
        det.x2,
        det.y2
      )
    })
    .collect()
}

/// 把检测结果写成文本记录，每行一个: 类别, 置信度, 边界框
pub fn record(detections: &DetectionSet, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
  let mut records = Vec::with_capacity(detections.len());
  for det in detections.iter() {
    records.push(format!(
      "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
      det.label, det.score, det.x1, det.y1, det.x2, det.y2
    ));
  }
  std::fs::write(path.as_ref().with_extension("txt"), records.join("\n"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::oracle::Detection;

  fn sample_set() -> DetectionSet {
    vec![Detection {
      x1: 10.0,
      y1: 20.0,
      x2: 110.0,
      y2: 220.0,
      score: 0.873,
      label: "building".into(),
    }]
    .into()
  }

  #[test]
  fn detection_line_format() {
    let lines = detection_lines(&sample_set());
    assert_eq!(
      lines,
      vec!["  1. building - Confidence: 0.873 - Box: [10.0, 20.0, 110.0, 220.0]"]
    );
  }

  #[test]
  fn detection_lines_are_one_indexed() {
    let set: DetectionSet = vec![
      Detection {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
        score: 0.5,
        label: "house".into(),
      },
      Detection {
        x1: 2.0,
        y1: 2.0,
        x2: 3.0,
        y2: 3.0,
        score: 0.25,
        label: "house".into(),
      },
    ]
    .into();
    let lines = detection_lines(&set);
    assert!(lines[0].starts_with("  1. house"));
    assert!(lines[1].starts_with("  2. house"));
  }

  #[test]
  fn draw_does_not_panic_on_oversized_boxes() {
    let renderer = Renderer::new();
    let mut image = RgbImage::new(32, 32);
    let set: DetectionSet = vec![Detection {
      x1: -10.0,
      y1: -10.0,
      x2: 100.0,
      y2: 100.0,
      score: 0.9,
      label: "building".into(),
    }]
    .into();
    renderer.draw(&mut image, &set);
  }

  #[test]
  fn draw_changes_pixels_inside_image() {
    let renderer = Renderer::new();
    let mut image = RgbImage::new(64, 64);
    let set: DetectionSet = vec![Detection {
      x1: 8.0,
      y1: 30.0,
      x2: 40.0,
      y2: 60.0,
      score: 0.9,
      label: "building".into(),
    }]
    .into();
    renderer.draw(&mut image, &set);
    assert!(image.pixels().any(|p| p.0 != [0, 0, 0]));
  }

  #[test]
  fn label_color_is_deterministic() {
    let renderer = Renderer::new();
    assert_eq!(
      renderer.label_color("building"),
      renderer.label_color("building")
    );
  }

  #[test]
  fn persist_creates_parent_directories() {
    let renderer = Renderer::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/deep/out.png");
    let image = RgbImage::new(4, 4);

    renderer.persist(&image, &path).unwrap();
    assert!(path.exists());
  }

  #[test]
  fn record_writes_one_line_per_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    record(&sample_set(), &path).unwrap();

    let text = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(text, "building, 0.8730, 10.0000, 20.0000, 110.0000, 220.0000");
  }
}
