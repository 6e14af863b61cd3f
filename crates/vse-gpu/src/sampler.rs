use crate::device::GpuDevice;
use crate::error::Result;
use crate::types::{SamplerDesc, SamplerId};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Samplers deduplicated by description.
pub struct SamplerCache {
    device: Arc<dyn GpuDevice>,
    samplers: Mutex<HashMap<SamplerDesc, SamplerId>>,
}

impl SamplerCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            samplers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let mut samplers = self.samplers.lock();
        if let Some(&sampler) = samplers.get(desc) {
            return Ok(sampler);
        }
        let sampler = self.device.create_sampler(desc)?;
        samplers.insert(*desc, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destroy_all(&self) {
        for (_, sampler) in self.samplers.lock().drain() {
            self.device.destroy_sampler(sampler);
        }
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::types::{AddressMode, Filter};

    #[test]
    fn equal_descriptions_share_a_sampler() {
        let device = HeadlessDevice::new_default();
        let cache = SamplerCache::new(device);
        let linear = SamplerDesc::default();
        let nearest = SamplerDesc {
            mag_filter: Filter::Nearest,
            address_u: AddressMode::ClampToEdge,
            ..linear
        };
        let a = cache.get_or_create(&linear).unwrap();
        assert_eq!(cache.get_or_create(&linear).unwrap(), a);
        assert_ne!(cache.get_or_create(&nearest).unwrap(), a);
        assert_eq!(cache.len(), 2);
    }
}
