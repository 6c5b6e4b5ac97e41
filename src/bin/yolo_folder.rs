// 该文件是 Wanglou （望楼） 项目的一部分。
// src/bin/yolo_folder.rs - 目录 YOLO 推理程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use wanglou::oracle::YoloOracle;
use wanglou::render::{self, Renderer};
use wanglou::source;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 对一个目录下的全部图像运行 YOLO 推理并保存标注结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// YOLO ONNX 模型权重路径
  #[arg(long, default_value = "yolo_best.onnx", value_name = "FILE")]
  pub model: PathBuf,

  /// 待推理的图像目录
  #[arg(long, value_name = "DIR")]
  pub source: PathBuf,

  /// 预测输出目录
  #[arg(long, default_value = "yolo_predictions", value_name = "DIR")]
  pub output: PathBuf,

  /// 置信度阈值 (0.0 - 1.0)，得分恰好等于阈值时保留
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub conf: f32,

  /// 推理图像尺寸
  #[arg(long, default_value = "640", value_name = "SIZE")]
  pub imgsz: u32,

  /// 推理设备（如 0 或 cpu，缺省使用 CPU）
  #[arg(long, value_name = "DEVICE")]
  pub device: Option<String>,
}

fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  if !args.model.exists() {
    eprintln!("Model not found: {}", args.model.display());
    return ExitCode::from(1);
  }
  if !args.source.is_dir() {
    eprintln!("Source folder not found: {}", args.source.display());
    return ExitCode::from(1);
  }

  match run(&args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("{:#}", err);
      ExitCode::from(1)
    }
  }
}

fn run(args: &Args) -> Result<()> {
  println!("正在加载模型...");
  let oracle = YoloOracle::new(&args.model, args.imgsz, args.device.as_deref())?;
  println!("模型加载完成");
  println!();

  let files = image_files(&args.source)?;
  if files.is_empty() {
    println!("No images found in '{}'", args.source.display());
    return Ok(());
  }

  let results_dir = args.output.join("results");
  std::fs::create_dir_all(&results_dir)?;

  let renderer = Renderer::new();
  let total = files.len();

  for (idx, path) in files.iter().enumerate() {
    let filename = path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();
    println!("[{}/{}] Processing: {}", idx + 1, total, filename);

    // 单个图像失败只记录，不中止整个目录
    if let Err(err) = process_one(&oracle, &renderer, path, &results_dir.join(&filename), args.conf)
    {
      error!("处理 {} 失败: {}", filename, err);
      println!("Error processing {}: {}", filename, err);
    }
  }

  println!();
  println!("Saved predictions to: {}", results_dir.display());
  Ok(())
}

fn process_one(
  oracle: &YoloOracle,
  renderer: &Renderer,
  input: &Path,
  output: &Path,
  conf: f32,
) -> Result<()> {
  let mut image = source::load(&input.to_string_lossy())?;
  let detections = oracle.infer(&image, conf)?;

  println!("Detected {} object(s):", detections.len());
  for line in render::detection_lines(&detections) {
    println!("{}", line);
  }

  renderer.draw(&mut image, &detections);
  renderer.persist(&image, output)?;
  if !detections.is_empty() {
    render::record(&detections, output)?;
  }

  Ok(())
}

/// 枚举常见扩展名的图像文件，按文件名字典序排序
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if !path.is_file() {
      continue;
    }
    let matched = path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| {
        IMAGE_EXTENSIONS
          .iter()
          .any(|known| known.eq_ignore_ascii_case(ext))
      })
      .unwrap_or(false);
    if matched {
      files.push(path);
    }
  }
  files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
  Ok(files)
}
