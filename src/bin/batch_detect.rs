// 该文件是 Wanglou （望楼） 项目的一部分。
// src/bin/batch_detect.rs - 目录批处理程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use wanglou::batch::{BatchRunner, BatchStatus};
use wanglou::oracle::{GroundingOracle, Prompt};
use wanglou::render::Renderer;

/// Wanglou 批处理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，需包含 model.onnx 与 tokenizer.json
  #[arg(long, value_name = "DIR")]
  pub model_dir: String,

  /// 输入图像目录
  #[arg(long, value_name = "DIR")]
  pub input_dir: PathBuf,

  /// 标注图像输出目录
  #[arg(long, value_name = "DIR")]
  pub output_dir: PathBuf,

  /// 检测提示词，多个类别短语以句点分隔
  #[arg(long, default_value = "building", value_name = "PROMPT")]
  pub prompt: Prompt,

  /// 置信度阈值 (0.0 - 1.0)，得分恰好等于阈值时保留
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub threshold: f32,

  /// 本次运行匹配的图像扩展名（大小写不敏感）
  #[arg(long, default_value = "png", value_name = "EXT")]
  pub ext: String,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  println!("正在加载模型...");
  let oracle = GroundingOracle::new(&args.model_dir)?;
  println!("模型加载完成");
  println!();

  let runner = BatchRunner::new(args.prompt, args.threshold, &args.ext);
  let report = runner.run(
    &oracle,
    &Renderer::new(),
    &args.input_dir,
    &args.output_dir,
  )?;

  match report.status {
    BatchStatus::NothingToProcess => {
      println!(
        "No {} images found in '{}'!",
        runner.extension().to_uppercase(),
        args.input_dir.display()
      );
    }
    BatchStatus::Completed => {
      println!();
      println!(
        "{} succeeded, {} failed",
        report.succeeded(),
        report.failed()
      );
      println!(
        "Processing complete! Results saved to '{}'",
        args.output_dir.display()
      );
    }
  }

  Ok(())
}
