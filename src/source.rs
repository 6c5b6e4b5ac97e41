// 该文件是 Wanglou （望楼） 项目的一部分。
// src/source.rs - 图像来源
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum SourceError {
  /// 网络或文件系统层面无法取得图像字节
  #[error("无法访问图像来源: {0}")]
  Unavailable(String),
  /// 字节流不是可解码的图像
  #[error("无法解码图像: {0}")]
  Decode(#[from] image::ImageError),
}

impl From<std::io::Error> for SourceError {
  fn from(err: std::io::Error) -> Self {
    SourceError::Unavailable(err.to_string())
  }
}

impl From<reqwest::Error> for SourceError {
  fn from(err: reqwest::Error) -> Self {
    SourceError::Unavailable(err.to_string())
  }
}

/// 判断引用是否为远程 URL（只认 http/https 方案）
fn is_remote(reference: &str) -> bool {
  match Url::parse(reference) {
    Ok(url) => url.scheme() == "http" || url.scheme() == "https",
    Err(_) => false,
  }
}

/// 读取图像引用（本地路径或远程 URL）并解码为 RGB 图像。
///
/// 无论来源的通道布局如何（灰度、调色板、带透明通道），
/// 结果一律归一化为 3 通道 RGB，后续推理假定该布局。
pub fn load(reference: &str) -> Result<RgbImage, SourceError> {
  let image = if is_remote(reference) {
    debug!("从远程地址获取图像: {}", reference);
    let bytes = reqwest::blocking::get(reference)?
      .error_for_status()?
      .bytes()?;
    image::load_from_memory(&bytes)?
  } else {
    debug!("从本地文件读取图像: {}", reference);
    ImageReader::open(reference)?.decode()?
  };

  Ok(image.to_rgb8())
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{GrayImage, Rgb, RgbaImage};

  #[test]
  fn remote_reference_detection() {
    assert!(is_remote("http://example.com/a.png"));
    assert!(is_remote("https://example.com/a.png"));
    assert!(!is_remote("/tmp/a.png"));
    assert!(!is_remote("relative/a.png"));
    assert!(!is_remote("ftp://example.com/a.png"));
  }

  #[test]
  fn load_local_rgb_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.png");
    let mut img = RgbImage::new(8, 4);
    img.put_pixel(3, 2, Rgb([10, 20, 30]));
    img.save(&path).unwrap();

    let loaded = load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.dimensions(), (8, 4));
    assert_eq!(loaded.get_pixel(3, 2), &Rgb([10, 20, 30]));
  }

  #[test]
  fn rgba_source_is_normalized_to_rgb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgba.png");
    let img = RgbaImage::from_pixel(4, 4, image::Rgba([1, 2, 3, 128]));
    img.save(&path).unwrap();

    let loaded = load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.dimensions(), (4, 4));
    assert_eq!(loaded.get_pixel(0, 0), &Rgb([1, 2, 3]));
  }

  #[test]
  fn grayscale_source_is_normalized_to_rgb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.png");
    let img = GrayImage::from_pixel(4, 4, image::Luma([200]));
    img.save(&path).unwrap();

    let loaded = load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.get_pixel(2, 2), &Rgb([200, 200, 200]));
  }

  #[test]
  fn missing_file_is_unavailable() {
    let err = load("/no/such/file.png").unwrap_err();
    assert!(matches!(err, SourceError::Unavailable(_)));
  }

  #[test]
  fn garbage_bytes_are_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.png");
    std::fs::write(&path, b"this is not a png").unwrap();

    let err = load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, SourceError::Decode(_)));
  }
}
