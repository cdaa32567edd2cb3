//! Battery voltage via the ESP32 ADC.
//!
//! The cell is wired to an ADC1 pin through a 1:1 resistor divider (ADC2 is
//! unusable while the WiFi radio is on).

use super::{SampleError, VoltageSensor};
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::gpio::ADCPin;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_sys::EspError;

/// Ratio between cell voltage and pin voltage.
const DIVIDER_RATIO: f32 = 2.0;

/// Readings averaged per sample to smooth ADC noise.
const OVERSAMPLE: u32 = 8;

/// Battery sensor on an ADC1 pin.
pub struct AdcBattery<'d, P: ADCPin<Adc = ADC1>> {
    channel: AdcChannelDriver<'d, P, AdcDriver<'d, ADC1>>,
}

impl<'d, P: ADCPin<Adc = ADC1>> AdcBattery<'d, P> {
    /// Configure the ADC for 0-3.1 V input range.
    pub fn new(
        adc: impl Peripheral<P = ADC1> + 'd,
        pin: impl Peripheral<P = P> + 'd,
    ) -> Result<Self, EspError> {
        let driver = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(driver, pin, &config)?;
        Ok(Self { channel })
    }
}

impl<'d, P: ADCPin<Adc = ADC1>> VoltageSensor for AdcBattery<'d, P> {
    fn read_volts(&mut self) -> Result<f32, SampleError> {
        let mut total_mv: u32 = 0;
        for _ in 0..OVERSAMPLE {
            let mv = self
                .channel
                .read()
                .map_err(|e| SampleError::Adc(format!("{:?}", e)))?;
            total_mv += u32::from(mv);
        }
        let pin_volts = total_mv as f32 / OVERSAMPLE as f32 / 1000.0;
        Ok(pin_volts * DIVIDER_RATIO)
    }
}
