use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::frame::Fence;

/// Provider type of the default CPU execution provider.
///
/// Kernels that pin an input position to CPU memory have their fence calls
/// issued with this provider type regardless of the node's own provider.
pub const CPU_PROVIDER: &str = "cpu";

/// Memory-type tag attached to kernel input and output positions.
///
/// The default is the provider's own device memory. The CPU tags pin a
/// position to host-accessible memory even when the kernel runs on an
/// accelerator, eg. for small shape or index tensors the kernel reads on the
/// host side.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemType {
    #[default]
    Default,
    CpuInput,
    CpuOutput,
}

/// Identifies a device memory location where a buffer can be placed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryInfo {
    /// Provider type owning the memory, eg. "cpu" or "cuda".
    pub provider: String,
    pub device_id: i32,
    pub mem_type: MemType,
}

impl MemoryInfo {
    pub fn new(provider: &str, device_id: i32, mem_type: MemType) -> MemoryInfo {
        MemoryInfo {
            provider: provider.to_owned(),
            device_id,
            mem_type,
        }
    }

    /// The default CPU memory location.
    pub fn cpu() -> MemoryInfo {
        MemoryInfo::new(CPU_PROVIDER, 0, MemType::Default)
    }
}

impl Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.device_id)?;
        match self.mem_type {
            MemType::Default => Ok(()),
            MemType::CpuInput => write!(f, " (cpu input)"),
            MemType::CpuOutput => write!(f, " (cpu output)"),
        }
    }
}

/// Factory used by providers whose devices have asynchronous queues to
/// create per-buffer synchronization fences.
pub type FenceFactory = Arc<dyn Fn() -> Arc<dyn Fence> + Send + Sync>;

/// An execution provider: a compute device together with the memory
/// locations its allocators serve.
pub struct Provider {
    provider_type: String,
    allocators: FxHashMap<MemType, MemoryInfo>,
    fence_factory: Option<FenceFactory>,
}

impl Provider {
    /// Create a provider whose default allocator serves `default_info`.
    pub fn new(provider_type: &str, default_info: MemoryInfo) -> Provider {
        let mut allocators = FxHashMap::default();
        allocators.insert(MemType::Default, default_info);
        Provider {
            provider_type: provider_type.to_owned(),
            allocators,
            fence_factory: None,
        }
    }

    /// Create the default CPU provider.
    pub fn cpu() -> Provider {
        Provider::new(CPU_PROVIDER, MemoryInfo::cpu())
    }

    /// Register a memory location for a non-default memory type.
    pub fn with_allocator(mut self, mem_type: MemType, info: MemoryInfo) -> Provider {
        self.allocators.insert(mem_type, info);
        self
    }

    /// Install a fence factory for devices with asynchronous queues.
    pub fn with_fence_factory(mut self, factory: FenceFactory) -> Provider {
        self.fence_factory = Some(factory);
        self
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Memory location served by the allocator for `mem_type`, falling back
    /// to the provider's default allocator for unregistered types.
    pub fn allocator_info(&self, mem_type: MemType) -> &MemoryInfo {
        self.allocators
            .get(&mem_type)
            .unwrap_or_else(|| &self.allocators[&MemType::Default])
    }

    /// Create a fence for a buffer on this provider's device, or `None` if
    /// the device has no asynchronous queues.
    pub fn create_fence(&self) -> Option<Arc<dyn Fence>> {
        self.fence_factory.as_ref().map(|factory| factory())
    }
}

/// Directory of registered execution providers, keyed by provider type.
pub struct ExecutionProviders {
    providers: FxHashMap<String, Provider>,
    default_cpu: MemoryInfo,
}

impl ExecutionProviders {
    pub fn new() -> ExecutionProviders {
        ExecutionProviders {
            providers: FxHashMap::default(),
            default_cpu: MemoryInfo::cpu(),
        }
    }

    /// Create a directory with only the default CPU provider registered.
    pub fn cpu_only() -> ExecutionProviders {
        let mut providers = ExecutionProviders::new();
        providers.register(Provider::cpu());
        providers
    }

    pub fn register(&mut self, provider: Provider) {
        self.providers
            .insert(provider.provider_type().to_owned(), provider);
    }

    pub fn get(&self, provider_type: &str) -> Option<&Provider> {
        self.providers.get(provider_type)
    }

    /// Memory location every provider can reach; weights read from multiple
    /// devices are placed here.
    pub fn default_cpu_memory_info(&self) -> &MemoryInfo {
        &self.default_cpu
    }
}

impl Default for ExecutionProviders {
    fn default() -> Self {
        ExecutionProviders::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionProviders, MemType, MemoryInfo, Provider};

    #[test]
    fn test_allocator_fallback() {
        let provider = Provider::new("cuda", MemoryInfo::new("cuda", 0, MemType::Default))
            .with_allocator(MemType::CpuInput, MemoryInfo::cpu());

        assert_eq!(
            provider.allocator_info(MemType::Default),
            &MemoryInfo::new("cuda", 0, MemType::Default)
        );
        assert_eq!(provider.allocator_info(MemType::CpuInput), &MemoryInfo::cpu());
        // Unregistered type falls back to the default allocator.
        assert_eq!(
            provider.allocator_info(MemType::CpuOutput),
            &MemoryInfo::new("cuda", 0, MemType::Default)
        );
    }

    #[test]
    fn test_directory_lookup() {
        let providers = ExecutionProviders::cpu_only();
        assert!(providers.get("cpu").is_some());
        assert!(providers.get("cuda").is_none());
        assert_eq!(providers.default_cpu_memory_info(), &MemoryInfo::cpu());
    }
}
