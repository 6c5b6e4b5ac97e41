// 该文件是 Wanglou （望楼） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;

use wanglou::oracle::Prompt;

/// Wanglou 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，需包含 model.onnx 与 tokenizer.json
  #[arg(long, value_name = "DIR")]
  pub model_dir: String,

  /// 输入图像（本地路径，或 http/https URL）
  #[arg(long, value_name = "SOURCE")]
  pub input: String,

  /// 检测提示词，多个类别短语以句点分隔
  /// 例如: "building . house . skyscraper"
  #[arg(long, default_value = "building", value_name = "PROMPT")]
  pub prompt: Prompt,

  /// 置信度阈值 (0.0 - 1.0)，得分恰好等于阈值时保留
  #[arg(long, default_value = "0.3", value_name = "THRESHOLD")]
  pub threshold: f32,

  /// 标注图像输出路径（缺省时不落盘）
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<String>,
}
