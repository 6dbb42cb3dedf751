#![no_main]
use libfuzzer_sys::fuzz_target;
use lilypad::{DaemonConfig, DaemonStates, FsDriver};

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        for driver in [FsDriver::Fuse, FsDriver::Fscache] {
            if let Ok(cfg) = DaemonConfig::from_json(driver, content) {
                // Whatever parses must dump again
                let dumped = cfg.dump_string().unwrap();
                let _ = DaemonConfig::from_json(driver, &dumped).unwrap();
                if let Ok(fscache) = cfg.as_fscache() {
                    let _ = fscache.work_dir();
                    let _ = fscache.metadata_path();
                }
            }
        }

        let _ = serde_json::from_str::<DaemonStates>(content);
    }
});
