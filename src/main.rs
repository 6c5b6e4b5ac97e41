// 该文件是 Wanglou （望楼） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::Result;
use clap::Parser;

use wanglou::oracle::{GroundingOracle, Oracle};
use wanglou::render::{self, Renderer};
use wanglou::source;

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  println!("Wanglou 零样本检测");
  println!("==================");
  println!("模型目录: {}", args.model_dir);
  println!("输入来源: {}", args.input);
  println!("提示词: {}", args.prompt);
  println!("置信度阈值: {}", args.threshold);
  println!();

  // 模型初始化失败立即终止：没有模型，后续调用都不会成功
  println!("正在加载模型...");
  let oracle = GroundingOracle::new(&args.model_dir)?;
  println!("模型加载完成");
  println!();

  println!("Detecting '{}' in image: {}", args.prompt, args.input);
  let image = source::load(&args.input)?;
  let detections = oracle.detect(&image, &args.prompt, args.threshold)?;

  println!();
  println!("Detected {} object(s):", detections.len());
  for line in render::detection_lines(&detections) {
    println!("{}", line);
  }

  if let Some(output) = &args.output {
    let renderer = Renderer::new();
    let mut annotated = image;
    renderer.draw(&mut annotated, &detections);
    renderer.persist(&annotated, output)?;
    println!();
    println!("Visualization saved to: {}", output);
  }

  Ok(())
}
