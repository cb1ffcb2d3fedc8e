use pcidev::access::{PCI_BASE_ADDRESS_0, PCI_BASE_ADDRESS_2};
use pcidev::{
    DeviceEntry, MemoryDevice, MemoryPciAccess, PciBdf, PciCommand, PciDevError, PciFilter,
    PciMatch, PciSession, ResolveOptions, TestStatus,
};

const NICS: &[DeviceEntry] = &[
    DeviceEntry::new(0x10ec, 0x8139, TestStatus::Ok, "Realtek", "RTL8139"),
    DeviceEntry::new(0x1113, 0x1211, TestStatus::Untested, "Accton", "SMC2-1211TX"),
    DeviceEntry::SENTINEL,
];

fn rtl8139(io_bar: u32) -> MemoryDevice {
    MemoryDevice::new(0x10ec, 0x8139)
        .with_command((PciCommand::IO | PciCommand::MEMORY).bits())
        .with_bar(0, io_bar, 0x100)
}

#[test]
fn io_bar_filter_counts_only_decoding_devices() {
    let bus = MemoryPciAccess::new();
    bus.add_device(PciBdf::new(1, 5, 0), rtl8139(0xd001));
    bus.add_device(PciBdf::new(2, 5, 0), rtl8139(0x0001));

    let mut session = PciSession::new();
    let dev = session
        .find_device(
            bus,
            NICS,
            &ResolveOptions::default().with_bar(PCI_BASE_ADDRESS_0),
        )
        .unwrap();
    assert_eq!(dev.bdf, PciBdf::new(1, 5, 0));
}

#[test]
fn unclassifiable_bar_counts_as_zero() {
    // Bridges only implement BAR0 and BAR1; BAR2 of a type 1 header classifies as unknown.
    let bus = MemoryPciAccess::new();
    bus.add_device(
        PciBdf::new(1, 5, 0),
        rtl8139(0xd001)
            .with_header_type(0x01)
            .with_bar_raw(2, 0xfe00_0000),
    );

    let mut session = PciSession::new();
    let err = session
        .find_device(
            bus,
            NICS,
            &ResolveOptions::default().with_bar(PCI_BASE_ADDRESS_2),
        )
        .unwrap_err();
    assert!(matches!(err, PciDevError::NoDeviceFound));
}

#[test]
fn rich_variant_uses_name_and_private_data() {
    let root = tempfile::tempdir().unwrap();
    let bdf = PciBdf::new(0, 3, 0);
    let dir = root.path().join(bdf.sysfs_name());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("enable"), "1").unwrap();

    let bus = MemoryPciAccess::new();
    bus.add_device(bdf, MemoryDevice::new(0x1113, 0x1211).with_name("Accton EN-1207D"));
    bus.add_device(PciBdf::new(0, 4, 0), MemoryDevice::new(0x1113, 0x1216));

    let matches = [PciMatch::new(0x1113, 0x1211, TestStatus::Untested, "smc")];
    let mut session = PciSession::with_sysfs_root(root.path());
    let dev = session
        .open_device(bus, &matches, &ResolveOptions::default())
        .unwrap();
    assert_eq!(dev.name(), "Accton EN-1207D");
    assert_eq!(*dev.private(), "smc");
    assert_eq!(dev.sysfs_path(), dir);
}

#[test]
fn rich_variant_without_name_database() {
    let root = tempfile::tempdir().unwrap();
    let bdf = PciBdf::new(0, 3, 0);
    let dir = root.path().join(bdf.sysfs_name());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("enable"), "1").unwrap();

    let bus = MemoryPciAccess::new();
    bus.add_device(bdf, MemoryDevice::new(0x10ec, 0x8139));

    let matches = [PciMatch::new(0x10ec, 0x8139, TestStatus::Ok, ())];
    let mut session = PciSession::with_sysfs_root(root.path());
    let dev = session
        .open_device(bus, &matches, &ResolveOptions::default())
        .unwrap();
    assert_eq!(dev.name(), "unknown");
}

#[test]
fn filter_string_errors_surface_parser_message() {
    let err = "00:20.0".parse::<PciFilter>().unwrap_err();
    assert_eq!(err.to_string(), "invalid PCI filter: Invalid slot number: \"20\"");
}
