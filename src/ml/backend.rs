//! バックエンドの選択とパニックの捕捉
//!
//! burn/cubecl は一部の失敗（GPUアダプタが無い、重みのデコード失敗）を
//! パニックで報告するため、ここで`anyhow`のエラーに変換する。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use anyhow::Result;
use burn::tensor::Tensor;
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::model::DeviceType;

/// クロージャ内のパニックをエラーとして返す
pub fn catch_backend_panic<T>(what: &str, f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| anyhow::anyhow!("{}: {}", what, panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// WGPUアダプタが使えるか（プロセス内で1回だけ確認）
pub fn wgpu_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let probe = catch_backend_panic("WGPUの初期化に失敗しました", || {
            Tensor::<Wgpu, 1>::zeros([1], &WgpuDevice::default()).into_data()
        });
        match probe {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("{:#}", e);
                false
            }
        }
    })
}

/// 実際に使うデバイス種別を決める（GPUが無ければCPUに切り替える）
pub fn resolve_device_type(requested: DeviceType) -> DeviceType {
    match requested {
        DeviceType::Cpu => DeviceType::Cpu,
        DeviceType::Wgpu if wgpu_available() => DeviceType::Wgpu,
        DeviceType::Wgpu => {
            tracing::warn!("GPUアダプタが見つかりません。CPU (NdArray) で実行します");
            DeviceType::Cpu
        }
    }
}
