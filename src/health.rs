use crate::prelude::*;

use crate::capture::Capture;

/// Check the serial device is present and opens with the configured settings.
///
/// Prints one OK/FAIL line per check, fails if any check failed.
pub fn check(config: &Config) -> Result<()> {
    let device = &config.device;
    let mut failures = 0;

    if std::path::Path::new(device.path()).exists() {
        println!("OK   device {} exists", device.path());

        match Capture::new(device.clone()).open() {
            Ok(_) => println!("OK   device {} opens at {} baud", device.path(), device.baud_rate()),
            Err(err) => {
                println!("FAIL device {} cannot be opened: {}", device.path(), err);
                failures += 1;
            }
        }
    } else {
        println!("FAIL device {} does not exist", device.path());
        failures += 1;
    }

    let schema = config.schema();
    if schema.is_empty() {
        println!("WARN no sensors configured");
    } else {
        println!("OK   {} sensors configured", schema.len());
    }

    if failures > 0 {
        bail!("health check failed for {}", device.name());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_fails() {
        let config = Config::from_yaml(
            "device:\n  name: em340\n  path: /nonexistent/ttyUSB9\nmqtt:\n  host: localhost\n",
        )
        .unwrap();

        assert!(check(&config).is_err());
    }
}
