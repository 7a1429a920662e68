//! HID report-descriptor parser.
//!
//! Implements the HID 1.11 item grammar: main items (input/output/
//! feature/collection), global items (with push/pop state), and local
//! items (usages and usage ranges). Parsing produces an immutable tree
//! of collection/item/usage nodes plus the computed input-report size.

use alloc::vec::Vec;

use lepton_core::{Errno, KResult};

// Item classes.
const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;
const TYPE_LOCAL: u8 = 2;

// Main item tags.
const INPUT_TAG: u8 = 0x8;
const OUTPUT_TAG: u8 = 0x9;
const FEATURE_TAG: u8 = 0xB;
const COLLECTION_TAG: u8 = 0xA;
const END_COLLECTION_TAG: u8 = 0xC;

// Global item tags.
const USAGE_PAGE_TAG: u8 = 0x0;
const LOGICAL_MINIMUM_TAG: u8 = 0x1;
const LOGICAL_MAXIMUM_TAG: u8 = 0x2;
const PHYSICAL_MINIMUM_TAG: u8 = 0x3;
const PHYSICAL_MAXIMUM_TAG: u8 = 0x4;
const REPORT_SIZE_TAG: u8 = 0x7;
const REPORT_ID_TAG: u8 = 0x8;
const REPORT_COUNT_TAG: u8 = 0x9;
const PUSH_TAG: u8 = 0xA;
const POP_TAG: u8 = 0xB;

// Local item tags.
const USAGE_TAG: u8 = 0x0;
const USAGE_MINIMUM_TAG: u8 = 0x1;
const USAGE_MAXIMUM_TAG: u8 = 0x2;

/// Collection kind for the synthetic root.
pub const COLLECTION_ROOT: u32 = 0xFF;

/// What kind of report an item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Device → host data.
    Input,
    /// Host → device data (LEDs).
    Output,
    /// Feature report.
    Feature,
}

/// A local usage entry: a single usage or an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageNode {
    /// Single usage (0 when this entry is a range).
    pub usage: u32,
    /// Range start.
    pub usage_min: u32,
    /// Range end.
    pub usage_max: u32,
}

/// A main data item with its captured global/local state.
#[derive(Debug, Clone)]
pub struct ItemNode {
    /// Input/output/feature.
    pub kind: ItemKind,
    /// Raw main-item flags (bit 1 = variable, bit 0 = constant).
    pub data: u16,
    /// Usage page in effect.
    pub usage_page: u32,
    /// Logical minimum.
    pub logical_min: i32,
    /// Logical maximum.
    pub logical_max: i32,
    /// Bits per field.
    pub report_size: u32,
    /// Report id in effect (0 = none).
    pub report_id: u32,
    /// Number of fields.
    pub report_count: u32,
    /// Local usages.
    pub usages: Vec<UsageNode>,
}

impl ItemNode {
    /// Total bits this item occupies in its report.
    pub fn size_bits(&self) -> u32 {
        self.report_size * self.report_count
    }

    /// Returns `true` if the item's usages cover `[min, max]` on `page`.
    pub fn covers_usage_range(&self, page: u32, min: u32, max: u32) -> bool {
        self.usage_page == page
            && self
                .usages
                .iter()
                .any(|u| u.usage_min <= min && u.usage_max >= max)
    }

    /// Finds the local usage entry equal to `usage` on `page`.
    pub fn find_usage(&self, page: u32, usage: u32) -> Option<usize> {
        if self.usage_page != page {
            return None;
        }
        self.usages.iter().position(|u| {
            u.usage == usage || (u.usage_min <= usage && usage <= u.usage_max && u.usage_max != 0)
        })
    }

    /// Byte offset of usage entry `index` within this item's fields.
    pub fn usage_byte_offset(&self, index: usize) -> usize {
        (index as u32 * self.report_size / 8) as usize
    }
}

/// A tree node: nested collection or data item.
#[derive(Debug, Clone)]
pub enum Node {
    /// A nested collection.
    Collection(CollectionNode),
    /// A data item.
    Item(ItemNode),
}

/// A collection with its children in descriptor order.
#[derive(Debug, Clone)]
pub struct CollectionNode {
    /// Collection kind byte (application, physical, ...).
    pub kind: u32,
    /// Usage page at the collection open.
    pub usage_page: u32,
    /// First local usage at the collection open.
    pub usage: u32,
    /// Children in order.
    pub children: Vec<Node>,
}

impl CollectionNode {
    /// Iterates all data items in the subtree, depth-first.
    pub fn items(&self) -> Vec<&ItemNode> {
        let mut out = Vec::new();
        let mut stack: Vec<&CollectionNode> = alloc::vec![self];
        while let Some(col) = stack.pop() {
            for child in &col.children {
                match child {
                    Node::Item(item) => out.push(item),
                    Node::Collection(sub) => stack.push(sub),
                }
            }
        }
        out
    }
}

/// A parsed report descriptor.
#[derive(Debug, Clone)]
pub struct ReportFormat {
    /// Synthetic root collection; its children are the top-level
    /// application collections.
    pub root: CollectionNode,
    /// Input-report size in bytes.
    pub size: usize,
}

impl ReportFormat {
    /// Returns the first top-level collection.
    pub fn top_collection(&self) -> Option<&CollectionNode> {
        self.root.children.iter().find_map(|n| match n {
            Node::Collection(c) => Some(c),
            Node::Item(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GlobalState {
    usage_page: u32,
    logical_min: i32,
    logical_max: i32,
    report_size: u32,
    report_id: u32,
    report_count: u32,
}

#[derive(Default)]
struct LocalState {
    usages: Vec<UsageNode>,
    usage_min: u32,
}

/// Parses a report descriptor.
///
/// # Errors
///
/// `EINVAL` on truncated items or unbalanced collections.
pub fn parse_report_descriptor(desc: &[u8]) -> KResult<ReportFormat> {
    let mut globals = GlobalState::default();
    let mut global_stack: Vec<GlobalState> = Vec::new();
    let mut locals = LocalState::default();

    // Collection stack; index 0 is the synthetic root.
    let mut stack: Vec<CollectionNode> = alloc::vec![CollectionNode {
        kind: COLLECTION_ROOT,
        usage_page: 0,
        usage: 0,
        children: Vec::new(),
    }];

    let mut pos = 0usize;
    while pos < desc.len() {
        let prefix = desc[pos];
        pos += 1;
        let size = match prefix & 0x3 {
            3 => 4usize,
            s => s as usize,
        };
        if pos + size > desc.len() {
            return Err(Errno::Inval);
        }
        let mut data: u32 = 0;
        for (i, &b) in desc[pos..pos + size].iter().enumerate() {
            data |= (b as u32) << (8 * i);
        }
        pos += size;

        let item_type = (prefix >> 2) & 0x3;
        let tag = (prefix >> 4) & 0xF;

        match item_type {
            TYPE_GLOBAL => match tag {
                USAGE_PAGE_TAG => globals.usage_page = data,
                LOGICAL_MINIMUM_TAG => globals.logical_min = sign_extend(data, size),
                LOGICAL_MAXIMUM_TAG => globals.logical_max = sign_extend(data, size),
                PHYSICAL_MINIMUM_TAG | PHYSICAL_MAXIMUM_TAG => {}
                REPORT_SIZE_TAG => globals.report_size = data,
                REPORT_ID_TAG => globals.report_id = data,
                REPORT_COUNT_TAG => globals.report_count = data,
                PUSH_TAG => global_stack.push(globals),
                POP_TAG => {
                    globals = global_stack.pop().ok_or(Errno::Inval)?;
                }
                _ => {}
            },
            TYPE_LOCAL => match tag {
                USAGE_TAG => locals.usages.push(UsageNode {
                    usage: data,
                    usage_min: data,
                    usage_max: data,
                }),
                USAGE_MINIMUM_TAG => locals.usage_min = data,
                USAGE_MAXIMUM_TAG => {
                    let min = locals.usage_min;
                    locals.usages.push(UsageNode {
                        usage: 0,
                        usage_min: min,
                        usage_max: data,
                    });
                }
                _ => {}
            },
            TYPE_MAIN => {
                match tag {
                    COLLECTION_TAG => {
                        let usage = locals.usages.first().map(|u| u.usage).unwrap_or(0);
                        stack.push(CollectionNode {
                            kind: data,
                            usage_page: globals.usage_page,
                            usage,
                            children: Vec::new(),
                        });
                    }
                    END_COLLECTION_TAG => {
                        if stack.len() < 2 {
                            return Err(Errno::Inval);
                        }
                        let done = stack.pop().expect("stack has root");
                        stack
                            .last_mut()
                            .expect("root remains")
                            .children
                            .push(Node::Collection(done));
                    }
                    INPUT_TAG | OUTPUT_TAG | FEATURE_TAG => {
                        let kind = match tag {
                            INPUT_TAG => ItemKind::Input,
                            OUTPUT_TAG => ItemKind::Output,
                            _ => ItemKind::Feature,
                        };
                        let item = ItemNode {
                            kind,
                            data: data as u16,
                            usage_page: globals.usage_page,
                            logical_min: globals.logical_min,
                            logical_max: globals.logical_max,
                            report_size: globals.report_size,
                            report_id: globals.report_id,
                            report_count: globals.report_count,
                            usages: core::mem::take(&mut locals.usages),
                        };
                        stack
                            .last_mut()
                            .expect("stack never empty")
                            .children
                            .push(Node::Item(item));
                    }
                    _ => {}
                }
                // Main items consume the local state.
                locals = LocalState::default();
            }
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(Errno::Inval);
    }
    let root = stack.pop().expect("root collection");

    // Input-report size: sum of input item bits across the tree.
    let bits: u32 = root
        .items()
        .iter()
        .filter(|i| i.kind == ItemKind::Input)
        .map(|i| i.size_bits())
        .sum();
    Ok(ReportFormat {
        root,
        size: bits.div_ceil(8) as usize,
    })
}

fn sign_extend(data: u32, size: usize) -> i32 {
    match size {
        1 => data as u8 as i8 as i32,
        2 => data as u16 as i16 as i32,
        _ => data as i32,
    }
}

/// The standard boot-protocol keyboard report descriptor (HID 1.11
/// appendix B.1), used by tests and as a fallback for boot-only devices.
pub const BOOT_KEYBOARD_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Keyboard)
    0x19, 0xE0, //   Usage Minimum (LeftControl)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute) — modifiers
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) — reserved byte
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (Num Lock)
    0x29, 0x05, //   Usage Maximum (Kana)
    0x91, 0x02, //   Output (Data, Variable, Absolute) — LEDs
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) — LED padding
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Keyboard)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array) — key array
    0xC0, // End Collection
];

/// The standard boot-protocol mouse report descriptor (HID 1.11
/// appendix B.2).
pub const BOOT_MOUSE_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Buttons)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute) — buttons
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant) — padding
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x02, //     Report Count (2)
    0x81, 0x06, //     Input (Data, Variable, Relative) — X/Y deltas
    0xC0, //   End Collection
    0xC0, // End Collection
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::usage;

    #[test]
    fn parses_boot_keyboard() {
        let format = parse_report_descriptor(BOOT_KEYBOARD_DESCRIPTOR).unwrap();
        // 8 modifier bits + 8 reserved + 6 key bytes = 8 bytes.
        assert_eq!(format.size, 8);

        let top = format.top_collection().unwrap();
        assert_eq!(top.usage_page, usage::GENERIC_DESKTOP_PAGE);
        assert_eq!(top.usage, usage::KEYBOARD_USAGE);

        let items = top.items();
        let inputs: Vec<_> = items.iter().filter(|i| i.kind == ItemKind::Input).collect();
        assert_eq!(inputs.len(), 3);
        // Modifier item covers the LeftControl..RightGUI range.
        assert!(inputs
            .iter()
            .any(|i| i.covers_usage_range(usage::KEYBOARD_PAGE, 0xE0, 0xE7)));
        // LED output item exists on the LED page.
        assert!(items
            .iter()
            .any(|i| i.kind == ItemKind::Output && i.usage_page == usage::LED_PAGE));
    }

    #[test]
    fn parses_boot_mouse() {
        let format = parse_report_descriptor(BOOT_MOUSE_DESCRIPTOR).unwrap();
        // 3 button bits + 5 pad + 2 delta bytes = 3 bytes.
        assert_eq!(format.size, 3);

        let top = format.top_collection().unwrap();
        assert_eq!(top.usage, usage::MOUSE_USAGE);

        // The X/Y item carries both usages with negative logical min.
        let items = top.items();
        let xy = items
            .iter()
            .find(|i| i.find_usage(usage::GENERIC_DESKTOP_PAGE, usage::X_USAGE).is_some())
            .unwrap();
        assert_eq!(xy.logical_min, -127);
        assert_eq!(xy.logical_max, 127);
        assert_eq!(xy.find_usage(usage::GENERIC_DESKTOP_PAGE, usage::Y_USAGE), Some(1));
        assert_eq!(xy.usage_byte_offset(1), 1);
    }

    #[test]
    fn rejects_unbalanced_collections() {
        // Missing End Collection.
        let desc = &BOOT_MOUSE_DESCRIPTOR[..BOOT_MOUSE_DESCRIPTOR.len() - 1];
        assert_eq!(parse_report_descriptor(desc).unwrap_err(), Errno::Inval);

        // Stray End Collection.
        assert_eq!(parse_report_descriptor(&[0xC0]).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn rejects_truncated_item() {
        // Prefix promising 2 data bytes with only 1 present.
        assert_eq!(parse_report_descriptor(&[0x06, 0x01]).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn push_pop_preserve_globals() {
        let desc: &[u8] = &[
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x75, 0x08, // Report Size 8
            0xA4, // Push
            0x75, 0x04, // Report Size 4
            0xB4, // Pop
            0x95, 0x01, // Report Count 1
            0x09, 0x30, // Usage (X)
            0x81, 0x02, // Input
        ];
        let format = parse_report_descriptor(desc).unwrap();
        let items = format.root.items();
        assert_eq!(items[0].report_size, 8);
    }
}
