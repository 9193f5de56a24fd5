use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xshell::{Shell, cmd};

const BINARIES: [&str; 2] = ["lubrisense-daemon", "lubrisense"];
const UNIT: &str = "lubrisense.service";

#[derive(Parser)]
#[command(name = "xtask", about = "Lubrisense 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建守护进程和 CLI (release)
    Build,
    /// 运行守护进程 (开发模式)
    Dev {
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
    },
    /// 安装到 ~/.local/bin 并启用 systemd 用户服务
    Install,
    /// 卸载 systemd 用户服务
    Uninstall,
    /// 打包发布 (tar.gz)
    Dist,
    /// 格式检查 + clippy
    Lint,
    /// 运行测试
    Test,
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir)
            .parent()
            .map(|p| p.to_path_buf())
            .context("xtask has no parent directory")?,
        Err(_) => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Dev { log_level } => dev(&sh, &log_level)?,
        Commands::Install => install(&sh)?,
        Commands::Uninstall => uninstall(&sh)?,
        Commands::Dist => dist(&sh)?,
        Commands::Lint => lint(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn home() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(
        sh,
        "cargo build --release -p lubrisense-daemon -p lubrisense-cli"
    )
    .run()?;
    println!("✅ 构建完成");
    Ok(())
}

fn dev(sh: &Shell, log_level: &str) -> Result<()> {
    println!("🚀 启动开发模式守护进程...");
    let rust_log = format!(
        "{level},lubrisense_core={level},btleplug=info",
        level = log_level
    );
    cmd!(sh, "cargo run -p lubrisense-daemon")
        .env("RUST_LOG", rust_log)
        .run()?;
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    println!("📦 安装 Lubrisense 服务...");

    build(sh)?;

    // 先停止已运行的服务（如果存在）
    println!("⏹️  停止现有服务...");
    let _ = cmd!(sh, "systemctl --user stop {UNIT}").run();

    let home = home()?;
    let bin_dir = home.join(".local/bin");
    let unit_dir = home.join(".config/systemd/user");
    sh.create_dir(&bin_dir)?;
    sh.create_dir(&unit_dir)?;

    println!("📋 复制二进制文件...");
    for bin in BINARIES {
        sh.copy_file(format!("target/release/{}", bin), &bin_dir)?;
    }
    sh.copy_file(format!("assets/{}", UNIT), &unit_dir)?;

    cmd!(sh, "systemctl --user daemon-reload").run()?;
    cmd!(sh, "systemctl --user enable --now {UNIT}").run()?;

    println!("✅ 服务安装完成");
    println!("   使用 'lubrisense --help' 查看命令");
    println!("   使用 'systemctl --user status lubrisense' 查看服务状态");
    Ok(())
}

fn uninstall(sh: &Shell) -> Result<()> {
    println!("🗑️  卸载 Lubrisense 服务...");

    let _ = cmd!(sh, "systemctl --user disable --now {UNIT}").run();

    let home = home()?;
    let _ = sh.remove_path(home.join(".config/systemd/user").join(UNIT));
    for bin in BINARIES {
        let _ = sh.remove_path(home.join(".local/bin").join(bin));
    }

    cmd!(sh, "systemctl --user daemon-reload").run()?;

    println!("✅ 卸载完成（已保存的设备列表保留在 ~/.config/lubrisense）");
    Ok(())
}

fn dist(sh: &Shell) -> Result<()> {
    println!("📦 打包发布...");

    build(sh)?;

    let version = env!("CARGO_PKG_VERSION");
    let dist_name = format!("lubrisense-{}-linux-x86_64", version);
    let dir = format!("dist/{}", dist_name);

    sh.create_dir(&dir)?;
    for bin in BINARIES {
        sh.copy_file(format!("target/release/{}", bin), &dir)?;
    }
    sh.copy_file(format!("assets/{}", UNIT), &dir)?;

    sh.change_dir("dist");
    cmd!(sh, "tar -czvf {dist_name}.tar.gz {dist_name}").run()?;

    println!("✅ 打包完成: dist/{}.tar.gz", dist_name);
    Ok(())
}

fn lint(sh: &Shell) -> Result<()> {
    println!("🔎 检查格式和 clippy...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("✅ 检查通过");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn coverage(sh: &Shell) -> Result<()> {
    println!("📊 运行测试覆盖率分析...");

    // 检查 cargo-tarpaulin 是否安装
    if cmd!(sh, "cargo tarpaulin --version").run().is_err() {
        println!("📦 安装 cargo-tarpaulin...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    println!("🔍 分析中...");
    cmd!(
        sh,
        "cargo tarpaulin --packages lubrisense-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    sh.remove_path("dist")?;
    println!("✅ 清理完成");
    Ok(())
}
