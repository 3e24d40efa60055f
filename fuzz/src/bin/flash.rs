// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use abflash::{device::StreamDevice, flash};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let Ok(mut device) = StreamDevice::new(Cursor::new(vec![0u8; 256 * 512]), 512)
                else {
                    return;
                };

                let _ = flash::flash_image(&mut device, data);
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
