use bscomp_device::DeviceError;

/// A device's window on the bus: global addresses `[start, end)` belong to `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
    pub slot: usize,
}

impl Window {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Global address layout of an assembled bus.
///
/// Windows are laid out back to back in slot order, each as large as the device's exported
/// memory. Devices exporting nothing get no window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    windows: Vec<Window>,
}

impl AddressMap {
    /// Lays out windows for devices with the given sizes, in slot order.
    ///
    /// A device whose window would end past `u64::MAX` is left unmapped, as is every device after
    /// it.
    pub fn new(sizes: impl IntoIterator<Item = u64>) -> Self {
        let mut windows = Vec::new();
        let mut next = 0u64;
        for (slot, size) in sizes.into_iter().enumerate() {
            if size == 0 {
                continue;
            }
            let Some(end) = next.checked_add(size) else {
                tracing::warn!(slot, size, "address space exhausted; device left unmapped");
                break;
            };
            windows.push(Window {
                start: next,
                end,
                slot,
            });
            next = end;
        }
        Self { windows }
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn window(&self, slot: usize) -> Option<Window> {
        self.windows.iter().copied().find(|w| w.slot == slot)
    }

    /// Total number of mapped bytes.
    pub fn size(&self) -> u64 {
        self.windows.last().map_or(0, |w| w.end)
    }

    /// Maps `[addr, addr + len)` to the owning slot and the device-local offset.
    ///
    /// The whole request must fall inside one window.
    pub fn translate(&self, addr: u64, len: usize) -> Result<(usize, u64), DeviceError> {
        let out_of_range = DeviceError::AddressOutOfRange { offset: addr, len };
        let end = addr.checked_add(len as u64).ok_or(out_of_range.clone())?;

        let idx = self
            .windows
            .partition_point(|w| w.start <= addr)
            .checked_sub(1)
            .ok_or(out_of_range.clone())?;
        let window = self.windows[idx];
        if addr >= window.end || end > window.end {
            return Err(out_of_range);
        }
        Ok((window.slot, addr - window.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_windows_in_slot_order_skipping_empty_devices() {
        let map = AddressMap::new([4096, 0, 16]);
        assert_eq!(
            map.windows(),
            [
                Window {
                    start: 0,
                    end: 4096,
                    slot: 0
                },
                Window {
                    start: 4096,
                    end: 4112,
                    slot: 2
                },
            ]
        );
        assert_eq!(map.size(), 4112);
        assert_eq!(map.window(1), None);
    }

    #[test]
    fn translates_to_device_local_offsets() {
        let map = AddressMap::new([4096, 16]);
        assert_eq!(map.translate(0, 2), Ok((0, 0)));
        assert_eq!(map.translate(4095, 1), Ok((0, 4095)));
        assert_eq!(map.translate(4096, 16), Ok((1, 0)));
        assert_eq!(map.translate(4100, 0), Ok((1, 4)));
    }

    #[test]
    fn rejects_straddling_and_unmapped_requests() {
        let map = AddressMap::new([4096, 16]);
        assert_eq!(
            map.translate(4095, 2),
            Err(DeviceError::AddressOutOfRange {
                offset: 4095,
                len: 2
            })
        );
        assert!(map.translate(4112, 1).is_err());
        assert!(map.translate(u64::MAX, 1).is_err());
        assert!(AddressMap::new([]).translate(0, 0).is_err());
    }

    #[test]
    fn stops_mapping_when_address_space_is_exhausted() {
        let map = AddressMap::new([u64::MAX, 1, 2]);
        assert_eq!(map.windows().len(), 1);
        assert_eq!(map.size(), u64::MAX);
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn translation_agrees_with_a_linear_scan(
                sizes in proptest::collection::vec(0u64..64, 0..8),
                addr in 0u64..600,
                len in 0usize..32,
            ) {
                let map = AddressMap::new(sizes.iter().copied());

                let mut expected = None;
                let mut base = 0u64;
                for (slot, &size) in sizes.iter().enumerate() {
                    if size > 0 && addr >= base && addr + len as u64 <= base + size && addr < base + size {
                        expected = Some((slot, addr - base));
                    }
                    base += size;
                }

                match expected {
                    Some(hit) => prop_assert_eq!(map.translate(addr, len), Ok(hit)),
                    None => prop_assert!(map.translate(addr, len).is_err()),
                }
            }

            #[test]
            fn windows_are_contiguous_and_sized(sizes in proptest::collection::vec(0u64..1 << 20, 0..16)) {
                let map = AddressMap::new(sizes.iter().copied());
                let mut next = 0;
                for window in map.windows() {
                    prop_assert_eq!(window.start, next);
                    prop_assert_eq!(window.len(), sizes[window.slot]);
                    next = window.end;
                }
                prop_assert_eq!(map.size(), sizes.iter().sum::<u64>());
            }
        }
    }
}
