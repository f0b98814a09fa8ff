use api_types::GpuStats;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::enum_wrappers::device::PcieUtilCounter;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

use super::Device;
use super::DeviceHandle;
use super::TelemetryBackend;
use super::TelemetryError;

/// Driver stack versions reported by NVML.
#[derive(Debug, Clone)]
pub struct Versions {
    pub driver: String,
    pub nvml: String,
    pub cuda_driver: i32,
}

/// NVML backed telemetry. Device handles are NVML enumeration indices.
pub struct NvmlBackend {
    nvml: Nvml,
}

impl NvmlBackend {
    pub fn init() -> Result<Self, Report<TelemetryError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialized successfully");
                nvml
            }
            Err(_) => {
                tracing::warn!("Standard NVML init failed, trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(TelemetryError::Init {
                        message: "NVML could not be loaded".to_string(),
                    })?;
                tracing::info!("NVML initialized with explicit library path");
                nvml
            }
        };
        Ok(Self { nvml })
    }

    pub fn versions(&self) -> Result<Versions, Report<TelemetryError>> {
        let init_error = || TelemetryError::Init {
            message: "failed to read driver versions".to_string(),
        };
        Ok(Versions {
            driver: self.nvml.sys_driver_version().change_context_lazy(init_error)?,
            nvml: self.nvml.sys_nvml_version().change_context_lazy(init_error)?,
            cuda_driver: self
                .nvml
                .sys_cuda_driver_version()
                .change_context_lazy(init_error)?,
        })
    }
}

impl TelemetryBackend for NvmlBackend {
    fn devices(&self) -> Result<Vec<Device>, Report<TelemetryError>> {
        let device_count = self
            .nvml
            .device_count()
            .change_context(TelemetryError::Enumeration)?;
        tracing::info!("Discovered {} GPU device(s)", device_count);

        let mut devices = Vec::with_capacity(device_count as usize);
        for i in 0..device_count {
            let device = self
                .nvml
                .device_by_index(i)
                .change_context(TelemetryError::Enumeration)
                .attach_printable_lazy(|| format!("device index {i}"))?;
            let uuid = device.uuid().change_context(TelemetryError::Enumeration)?;
            let name = device.name().change_context(TelemetryError::Enumeration)?;
            let bus_id = device
                .pci_info()
                .change_context(TelemetryError::Enumeration)?
                .bus_id;
            let index = device
                .minor_number()
                .change_context(TelemetryError::Enumeration)?;

            tracing::info!("Found GPU {}: {} ({}) at {}", i, uuid, name, bus_id);
            devices.push(Device {
                index,
                path: Device::host_path(index),
                uuid,
                bus_id,
                name,
                handle: DeviceHandle::new(i),
            });
        }
        Ok(devices)
    }

    fn device_stats(&self, device: &Device) -> Result<GpuStats, Report<TelemetryError>> {
        let query_error = || TelemetryError::Query {
            device: device.uuid.clone(),
        };
        let nvml_device = self
            .nvml
            .device_by_index(device.handle.raw())
            .change_context_lazy(query_error)?;

        let utilization = nvml_device
            .utilization_rates()
            .change_context_lazy(query_error)?;
        let memory_info = nvml_device.memory_info().change_context_lazy(query_error)?;
        let encoder = nvml_device
            .encoder_utilization()
            .change_context_lazy(query_error)?;
        let decoder = nvml_device
            .decoder_utilization()
            .change_context_lazy(query_error)?;
        let temperature = nvml_device
            .temperature(TemperatureSensor::Gpu)
            .change_context_lazy(query_error)?;

        // Get GPU clock frequencies
        let graphics_clock = nvml_device
            .clock_info(Clock::Graphics)
            .change_context_lazy(query_error)?;
        let sm_clock = nvml_device
            .clock_info(Clock::SM)
            .change_context_lazy(query_error)?;
        let memory_clock = nvml_device
            .clock_info(Clock::Memory)
            .change_context_lazy(query_error)?;

        let pcie_tx = nvml_device
            .pcie_throughput(PcieUtilCounter::Send)
            .change_context_lazy(query_error)?;
        let pcie_rx = nvml_device
            .pcie_throughput(PcieUtilCounter::Receive)
            .change_context_lazy(query_error)?;

        // Not every board reports these
        let power_usage = nvml_device.power_usage().ok();
        let fan_speed = nvml_device.fan_speed(0).ok();

        Ok(GpuStats {
            uuid: device.uuid.clone(),
            name: device.name.clone(),
            bus_id: device.bus_id.clone(),
            gpu_utilization: utilization.gpu,
            memory_utilization: utilization.memory,
            encoder_utilization: encoder.utilization,
            decoder_utilization: decoder.utilization,
            memory_total: memory_info.total,
            memory_used: memory_info.used,
            memory_free: memory_info.free,
            temperature,
            power_usage,
            fan_speed,
            graphics_clock,
            sm_clock,
            memory_clock,
            pcie_rx,
            pcie_tx,
        })
    }
}
