//! Adapter capability probing
//!
//! A trial is a full session at the requested configuration followed by one
//! real operation. Only adapters where both steps succeed are reported, and
//! the trial session is destroyed before the next adapter is tried.

use crate::config::{DecoderConfig, EncoderConfig};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::session::{
    create_decoder, BackendSession, DeviceRequest, EncodeSession, SessionInput, SessionKind,
    SessionOutput,
};
use crate::types::{AdapterDescriptor, ApiKind, Codec, Luid, Vendor};

/// Codecs the hardware backends accept
const BACKEND_CODECS: [Codec; 2] = [Codec::H264, Codec::Hevc];

/// Adapters of `vendor` that can encode at `config`, at most `max`
pub fn test_encode<P: Platform>(
    platform: &P,
    vendor: Vendor,
    config: &EncoderConfig,
    max: usize,
) -> Result<Vec<AdapterDescriptor>> {
    if SessionKind::for_vendor(vendor, true).is_none() {
        tracing::debug!("{} has no encode backend, nothing to probe", vendor);
        return Ok(Vec::new());
    }
    probe_adapters(platform, vendor, max, |luid| {
        let request = DeviceRequest::new(luid, config.api);
        let mut session = EncodeSession::<P::Encoder>::create(platform, request, config)?;
        let result = session.self_test();
        session.destroy();
        result
    })
}

/// Adapters of `vendor` that decode `sample` into at least one frame, at most `max`
pub fn test_decode<P: Platform>(
    platform: &P,
    vendor: Vendor,
    config: &DecoderConfig,
    sample: &[u8],
    max: usize,
) -> Result<Vec<AdapterDescriptor>> {
    if SessionKind::for_vendor(vendor, false).is_none() {
        tracing::debug!("{} has no decode backend, nothing to probe", vendor);
        return Ok(Vec::new());
    }
    probe_adapters(platform, vendor, max, |luid| {
        let request = DeviceRequest::new(luid, config.api);
        let mut session = create_decoder(platform, vendor, request, config)?;
        let result = decode_sample(session.as_mut(), sample);
        session.destroy();
        match result {
            Ok(0) => Err(Error::Output("sample produced no frame".into())),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    })
}

fn decode_sample(session: &mut dyn BackendSession, sample: &[u8]) -> Result<usize> {
    session.submit(SessionInput::Bitstream(sample))?;
    let mut frames = 0;
    while let Some(output) = session.drain_output()? {
        if let SessionOutput::Frame(_) = output {
            frames += 1;
        }
    }
    Ok(frames)
}

fn probe_adapters<P, F>(platform: &P, vendor: Vendor, max: usize, mut trial: F) -> Result<Vec<AdapterDescriptor>>
where
    P: Platform,
    F: FnMut(Luid) -> Result<()>,
{
    let mut capable = Vec::new();
    if max == 0 {
        return Ok(capable);
    }

    let adapters = platform.enumerate_adapters(vendor)?;
    tracing::debug!("Probing {} {} adapter(s) on {}", adapters.len(), vendor, platform.name());
    for luid in adapters {
        match trial(luid) {
            Ok(()) => {
                tracing::info!("{} adapter {} passed capability trial", vendor, luid);
                capable.push(AdapterDescriptor { luid, vendor });
                if capable.len() >= max {
                    break;
                }
            }
            Err(e) => tracing::warn!("{} adapter {} failed capability trial: {}", vendor, luid, e),
        }
    }
    Ok(capable)
}

/// Check that the vendor runtime can be loaded, then release it
pub fn driver_support<P: Platform>(platform: &P, vendor: Vendor) -> Result<()> {
    let driver = platform.acquire_driver(vendor)?;
    tracing::debug!("{} runtime available ({} libraries)", vendor, driver.library_count());
    Ok(())
}

/// (api, codec) pairs a vendor encode backend can be asked for
pub fn possible_encoders<P: Platform>(platform: &P, vendor: Vendor) -> Vec<(ApiKind, Codec)> {
    possible(platform, vendor, true)
}

/// (api, codec) pairs a vendor decode backend can be asked for
pub fn possible_decoders<P: Platform>(platform: &P, vendor: Vendor) -> Vec<(ApiKind, Codec)> {
    possible(platform, vendor, false)
}

fn possible<P: Platform>(platform: &P, vendor: Vendor, encode: bool) -> Vec<(ApiKind, Codec)> {
    if SessionKind::for_vendor(vendor, encode).is_none() {
        return Vec::new();
    }
    if let Err(e) = driver_support(platform, vendor) {
        tracing::debug!("{}: {}", vendor, e);
        return Vec::new();
    }
    ApiKind::native()
        .iter()
        .flat_map(|api| BACKEND_CODECS.iter().map(move |codec| (*api, *codec)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{
        FaultPlan, ReferencePlatform, StreamPacket, AMD_LUID, INTEL_LUID, NVIDIA_LUID,
    };
    use crate::types::Resolution;

    fn encoder_config() -> EncoderConfig {
        EncoderConfig::default().with_resolution(320, 180)
    }

    fn sample(codec: Codec) -> Vec<u8> {
        StreamPacket::new(codec, Resolution::new(320, 180)).to_bytes()
    }

    #[test]
    fn test_encode_probe_skips_failing_adapter() {
        let second = Luid(0x1002_0002);
        let platform = ReferencePlatform::new()
            .with_adapter(second, Vendor::Amd)
            .with_adapter_faults(
                AMD_LUID,
                FaultPlan {
                    fail_engine_init: true,
                    ..Default::default()
                },
            );

        let found = test_encode(&platform, Vendor::Amd, &encoder_config(), 8).unwrap();
        assert_eq!(found, vec![AdapterDescriptor { luid: second, vendor: Vendor::Amd }]);
        assert_eq!(platform.store().live_objects(), 0);
        assert!(!platform.drivers().is_loaded(Vendor::Amd));
    }

    #[test]
    fn test_probe_respects_max() {
        let platform = ReferencePlatform::new()
            .with_adapter(Luid(0x1002_0002), Vendor::Amd)
            .with_adapter(Luid(0x1002_0003), Vendor::Amd);

        let found = test_encode(&platform, Vendor::Amd, &encoder_config(), 2).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].luid, AMD_LUID);
        assert!(test_encode(&platform, Vendor::Amd, &encoder_config(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_encode_probe_without_backend_is_empty() {
        let platform = ReferencePlatform::new();
        assert!(test_encode(&platform, Vendor::Nvidia, &encoder_config(), 4).unwrap().is_empty());
    }

    #[test]
    fn test_decode_probe_needs_a_frame() {
        let platform = ReferencePlatform::new();
        let config = DecoderConfig::default();

        let found = test_decode(&platform, Vendor::Nvidia, &config, &sample(Codec::H264), 4).unwrap();
        assert_eq!(found, vec![AdapterDescriptor { luid: NVIDIA_LUID, vendor: Vendor::Nvidia }]);

        let found = test_decode(&platform, Vendor::Intel, &config, &sample(Codec::H264), 4).unwrap();
        assert_eq!(found, vec![AdapterDescriptor { luid: INTEL_LUID, vendor: Vendor::Intel }]);

        // A buffered packet decodes cleanly but yields nothing
        let held = StreamPacket::new(Codec::H264, Resolution::new(320, 180))
            .with_hold()
            .to_bytes();
        assert!(test_decode(&platform, Vendor::Nvidia, &config, &held, 4).unwrap().is_empty());
        assert!(test_decode(&platform, Vendor::Nvidia, &config, b"garbage", 4).unwrap().is_empty());
        assert_eq!(platform.store().live_objects(), 0);
    }

    #[test]
    fn test_driver_check_goes_through_platform_registry() {
        let platform = ReferencePlatform::new();
        driver_support(&platform, Vendor::Nvidia).unwrap();
        assert!(!platform.drivers().is_loaded(Vendor::Nvidia));

        let held = platform.drivers().acquire(Vendor::Nvidia).unwrap();
        driver_support(&platform, Vendor::Nvidia).unwrap();
        assert_eq!(platform.drivers().handle_count(Vendor::Nvidia), 1);
        drop(held);
        assert!(!platform.drivers().is_loaded(Vendor::Nvidia));
    }

    #[test]
    fn test_possible_support_follows_driver() {
        let platform = ReferencePlatform::new().without_driver(Vendor::Intel);
        assert!(driver_support(&platform, Vendor::Amd).is_ok());
        assert!(matches!(
            driver_support(&platform, Vendor::Intel),
            Err(Error::DriverUnavailable(_))
        ));

        let encoders = possible_encoders(&platform, Vendor::Amd);
        assert_eq!(encoders.len(), ApiKind::native().len() * 2);
        assert!(encoders.iter().all(|(_, codec)| *codec != Codec::Av1));
        assert!(possible_encoders(&platform, Vendor::Nvidia).is_empty());
        assert!(!possible_decoders(&platform, Vendor::Nvidia).is_empty());
        assert!(possible_decoders(&platform, Vendor::Intel).is_empty());
        assert!(!platform.drivers().is_loaded(Vendor::Amd));
    }
}
