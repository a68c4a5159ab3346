//! CoreGraphics transfer-table backend
//!
//! Display enumeration goes through `core-graphics`; the transfer-table calls
//! are not wrapped by that crate and are declared here directly.

use crate::core::error::{Error, Result};
use crate::core::gamma::{DisplayId, GammaDevice, TransferTable};
use core_graphics::display::CGDisplay;

type CGError = i32;
type CGGammaValue = f32;

const K_CG_ERROR_SUCCESS: CGError = 0;

#[link(name = "CoreGraphics", kind = "framework")]
unsafe extern "C" {
    fn CGDisplayGammaTableCapacity(display: DisplayId) -> u32;

    fn CGGetDisplayTransferByTable(
        display: DisplayId,
        capacity: u32,
        red: *mut CGGammaValue,
        green: *mut CGGammaValue,
        blue: *mut CGGammaValue,
        sample_count: *mut u32,
    ) -> CGError;

    fn CGSetDisplayTransferByTable(
        display: DisplayId,
        table_size: u32,
        red: *const CGGammaValue,
        green: *const CGGammaValue,
        blue: *const CGGammaValue,
    ) -> CGError;
}

/// Transfer tables of the displays attached to this Mac
#[derive(Debug, Default)]
pub struct MacDisplays;

impl GammaDevice for MacDisplays {
    fn active_displays(&self) -> Result<Vec<DisplayId>> {
        CGDisplay::active_displays()
            .map_err(|code| Error::Internal(format!("CGGetActiveDisplayList failed ({code})")))
    }

    fn table_capacity(&self, display: DisplayId) -> Result<u32> {
        // SAFETY: plain value call; unknown displays report zero
        Ok(unsafe { CGDisplayGammaTableCapacity(display) })
    }

    fn read_table(&self, display: DisplayId, capacity: u32) -> Result<TransferTable> {
        let len = capacity as usize;
        let mut red = vec![0.0; len];
        let mut green = vec![0.0; len];
        let mut blue = vec![0.0; len];
        let mut samples = 0u32;

        // SAFETY: each buffer holds `capacity` samples and outlives the call
        let code = unsafe {
            CGGetDisplayTransferByTable(
                display,
                capacity,
                red.as_mut_ptr(),
                green.as_mut_ptr(),
                blue.as_mut_ptr(),
                &raw mut samples,
            )
        };
        if code != K_CG_ERROR_SUCCESS {
            return Err(Error::DisplayQuery {
                display,
                message: format!("CGGetDisplayTransferByTable failed ({code})"),
            });
        }

        let samples = (samples as usize).min(len);
        red.truncate(samples);
        green.truncate(samples);
        blue.truncate(samples);
        Ok(TransferTable { red, green, blue })
    }

    fn write_table(&self, display: DisplayId, table: &TransferTable) -> Result<()> {
        let len = table.red.len().min(table.green.len()).min(table.blue.len());
        let size = u32::try_from(len).map_err(|_| Error::DisplayWrite {
            display,
            message: format!("table of {len} samples is too large"),
        })?;

        // SAFETY: all three slices hold at least `size` samples
        let code = unsafe {
            CGSetDisplayTransferByTable(
                display,
                size,
                table.red.as_ptr(),
                table.green.as_ptr(),
                table.blue.as_ptr(),
            )
        };
        if code != K_CG_ERROR_SUCCESS {
            return Err(Error::DisplayWrite {
                display,
                message: format!("CGSetDisplayTransferByTable failed ({code})"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_display_has_no_table() {
        assert_eq!(MacDisplays.table_capacity(u32::MAX).unwrap(), 0);
    }
}
