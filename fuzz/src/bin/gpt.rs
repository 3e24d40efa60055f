// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use abflash::{device::StreamDevice, format::gpt::GptCodec};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let codec = GptCodec::default();
                let Ok(mut device) = StreamDevice::new(Cursor::new(vec![0u8; 128 * 512]), 512)
                else {
                    return;
                };

                if codec.write_table(&mut device, data).is_ok()
                    && let Ok(primary) = codec.read_primary(&mut device)
                {
                    let _ = codec.read_backup(&mut device, primary.header());
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
