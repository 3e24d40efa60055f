// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use abflash::format::sparse::SparseReader;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(mut reader) = SparseReader::new(data) {
                    while let Ok(chunk) = reader.next_header() {
                        if reader.read_payload(&chunk).is_err() {
                            break;
                        }
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
