use std::sync::Arc;

use hsa_dispatch::{DeviceConfig, DeviceRegistry, HsaDevice, HsaLibrary};

fn runtime_or_skip() -> Option<(Arc<HsaLibrary>, DeviceRegistry)> {
    let runtime = match HsaLibrary::load() {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            eprintln!("skipping HSA runtime test: {err}");
            return None;
        }
    };
    match DeviceRegistry::discover(&*runtime) {
        Ok(registry) if !registry.is_empty() => Some((runtime, registry)),
        Ok(_) => {
            eprintln!("skipping HSA runtime test: no kernel agents");
            None
        }
        Err(err) => {
            eprintln!("skipping HSA runtime test: {err}");
            None
        }
    }
}

#[test]
fn first_agent_opens_and_tears_down_cleanly() {
    let Some((runtime, registry)) = runtime_or_skip() else {
        return;
    };
    let agent = registry.get(0).expect("registry is not empty");
    assert!(!agent.name.is_empty());
    assert!(agent.local_mem_size > 0);

    let device = HsaDevice::open(Arc::clone(&runtime), agent, 0, DeviceConfig::default())
        .expect("open first agent");
    assert!(device.queue().size.is_power_of_two());
    let report = device.teardown().expect("teardown");
    assert_eq!(report.queues, 1);
    assert_eq!(report.code_objects, 0);
}
