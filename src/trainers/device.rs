use candle_core::Device;
use log::debug;

/// Resolve a device name. Unknown names and unavailable accelerators fall
/// back to the CPU.
pub fn select_device(name: &str) -> Device {
    let requested = name.trim().to_ascii_lowercase();
    let (kind, ordinal) = match requested.split_once(':') {
        Some((kind, idx)) => (kind.to_string(), idx.parse::<usize>().unwrap_or(0)),
        None => (requested.clone(), 0),
    };

    let device = match kind.as_str() {
        "cuda" | "gpu" => Device::cuda_if_available(ordinal).unwrap_or(Device::Cpu),
        "metal" | "mps" => Device::new_metal(ordinal).unwrap_or(Device::Cpu),
        _ => Device::Cpu,
    };

    if device.is_cpu() && kind != "cpu" {
        debug!("Requested device {:?} unavailable, using CPU", name);
    }
    device
}
