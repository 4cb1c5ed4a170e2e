// build.rs
// Compiles the ray-tracing shaders to SPIR-V when the Vulkan SDK is available

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Ray-tracing stage extensions understood by glslc
const SHADER_EXTENSIONS: [&str; 6] = ["rgen", "rchit", "rahit", "rmiss", "rint", "rcall"];

fn is_ray_tracing_shader(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| SHADER_EXTENSIONS.contains(&ext))
}

fn needs_compile(source: &Path, output: &Path) -> bool {
    match (
        std::fs::metadata(source).and_then(|m| m.modified()),
        std::fs::metadata(output).and_then(|m| m.modified()),
    ) {
        (Ok(src), Ok(dst)) => src > dst,
        _ => true,
    }
}

/// Compile one shader, returning false on failure
fn compile_shader(glslc: &str, source: &Path, output: &Path, include_dir: &Path) -> bool {
    let status = Command::new(glslc)
        .arg("--target-env=vulkan1.2")
        .arg("-I")
        .arg(include_dir)
        .arg(source)
        .arg("-o")
        .arg(output)
        .status();

    match status {
        Ok(s) if s.success() => {
            eprintln!("info: Compiled {:?} -> {:?}", source, output);
            true
        }
        Ok(s) => {
            println!(
                "cargo:warning=glslc failed for {:?} with exit code {}",
                source,
                s.code().unwrap_or(-1)
            );
            false
        }
        Err(e) => {
            println!("cargo:warning=Failed to run glslc for {:?}: {}", source, e);
            false
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=../../resources/shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Ok(vulkan_sdk) = env::var("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader compilation skipped");
        eprintln!("hint: Install Vulkan SDK and set VULKAN_SDK environment variable");
        return;
    };

    let glslc = if cfg!(target_os = "windows") {
        format!("{}\\Bin\\glslc.exe", vulkan_sdk)
    } else {
        format!("{}/bin/glslc", vulkan_sdk)
    };
    if !Path::new(&glslc).exists() {
        println!("cargo:warning=glslc not found at {}, shader compilation skipped", glslc);
        return;
    }

    let shader_dir = PathBuf::from("../../resources/shaders");
    let target_dir = PathBuf::from("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        println!("cargo:warning=Failed to create {:?}: {}", target_dir, e);
        return;
    }

    let Ok(entries) = std::fs::read_dir(&shader_dir) else {
        eprintln!("info: No shader directory found at: {:?}", shader_dir);
        return;
    };

    let mut compiled = 0;
    let mut failed = 0;
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        if !is_ray_tracing_shader(&path) {
            continue;
        }
        let Some(stem) = path.file_stem() else { continue };
        let output = target_dir.join(stem).with_extension("spv");

        if !needs_compile(&path, &output) {
            continue;
        }
        if compile_shader(&glslc, &path, &output, &shader_dir) {
            compiled += 1;
        } else {
            failed += 1;
        }
    }

    eprintln!("info: {} shader(s) compiled, {} failed", compiled, failed);
}
