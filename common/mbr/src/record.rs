// Licensed under the Apache-2.0 license

//! On-flash layout of the master boot record and the packed words inside it.
//! Bit-exact: plain little-endian integers via zerocopy, bit packing via
//! explicit bitfield accessors, no reliance on host struct layout tricks.

use bitfield::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Fixed magic byte every firmware header carries in its `signal` lane.
pub const FW_SIGNAL_MAGIC: u8 = 0x55;

/// Checksum sentinel: the slot holds no image; never verifies.
pub const CHECKSUM_NONE: u32 = 0x0000_0000;

/// Checksum sentinel: factory/pre-verified slot; verifies without a CRC pass.
pub const CHECKSUM_NO_VERIFY: u32 = 0xFFFF_FFFF;

/// Length of the NUL-terminated hardware-version string field.
pub const HW_VERSION_LEN: usize = 16;

bitfield! {
    /// The firmware `type` word: `mem | enc | app | signal`, one byte each,
    /// `mem` in the least significant lane.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ImageType(u32);
    impl Debug;
    u8;
    pub mem, set_mem: 7, 0;
    pub enc, set_enc: 15, 8;
    pub app, set_app: 23, 16;
    pub signal, set_signal: 31, 24;
}

impl ImageType {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(word: u32) -> Self {
        ImageType(word)
    }

    pub fn new(mem: MemKind, enc: EncKind, app: AppKind) -> Self {
        let mut word = ImageType(0);
        word.set_mem(mem as u8);
        word.set_enc(enc as u8);
        word.set_app(app as u8);
        word.set_signal(FW_SIGNAL_MAGIC);
        word
    }
}

bitfield! {
    /// The firmware `version` word: `build:u16 | minor:u8 | major:u8`.
    /// The packed word compares correctly as a plain integer.
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct FwVersion(u32);
    impl Debug;
    pub u16, build, set_build: 15, 0;
    pub u8, minor, set_minor: 23, 16;
    pub u8, major, set_major: 31, 24;
}

impl FwVersion {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(word: u32) -> Self {
        FwVersion(word)
    }

    pub fn new(major: u8, minor: u8, build: u16) -> Self {
        let mut word = FwVersion(0);
        word.set_major(major);
        word.set_minor(minor);
        word.set_build(build);
        word
    }
}

/// Where a slot's image bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemKind {
    Internal = 0,
    External = 1,
}

impl TryFrom<u8> for MemKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MemKind::Internal),
            1 => Ok(MemKind::External),
            _ => Err(()),
        }
    }
}

/// How a slot's payload is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncKind {
    Raw = 0,
    Encrypted = 1,
    HeaderRaw = 2,
    HeaderEncrypted = 3,
}

impl EncKind {
    /// Payload bytes are AES-encrypted.
    pub fn is_encrypted(self) -> bool {
        matches!(self, EncKind::Encrypted | EncKind::HeaderEncrypted)
    }

    /// Payload is prefixed with a `FirmwareHeader` that is not part of the
    /// executable image.
    pub fn has_header(self) -> bool {
        matches!(self, EncKind::HeaderRaw | EncKind::HeaderEncrypted)
    }
}

impl TryFrom<u8> for EncKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncKind::Raw),
            1 => Ok(EncKind::Encrypted),
            2 => Ok(EncKind::HeaderRaw),
            3 => Ok(EncKind::HeaderEncrypted),
            _ => Err(()),
        }
    }
}

/// Which program kind an image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppKind {
    Boot = 0,
    Main = 1,
}

impl TryFrom<u8> for AppKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AppKind::Boot),
            1 => Ok(AppKind::Main),
            _ => Err(()),
        }
    }
}

/// Slot health as recorded in the MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppStatus {
    None = 0,
    Ok = 1,
}

impl TryFrom<u8> for AppStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AppStatus::None),
            1 => Ok(AppStatus::Ok),
            _ => Err(()),
        }
    }
}

/// Persisted boot-mode state machine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartupMode {
    Upgrade = 0,
    MainRun = 1,
    MainRollback = 2,
    BootRun = 3,
    BootRollback = 4,
    None = 5,
}

impl TryFrom<u8> for StartupMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StartupMode::Upgrade),
            1 => Ok(StartupMode::MainRun),
            2 => Ok(StartupMode::MainRollback),
            3 => Ok(StartupMode::BootRun),
            4 => Ok(StartupMode::BootRollback),
            5 => Ok(StartupMode::None),
            _ => Err(()),
        }
    }
}

/// Upgrade admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuMode {
    /// Accept any verified candidate.
    UpgradeAny = 0,
    /// Refuse candidates whose version is not greater than the current one.
    UpgradeUp = 1,
}

impl TryFrom<u8> for DfuMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DfuMode::UpgradeAny),
            1 => Ok(DfuMode::UpgradeUp),
            _ => Err(()),
        }
    }
}

/// On-flash firmware image header, 16 bytes.
///
/// The slot checksum in `checksum` covers the 12 bytes that follow it
/// (`size`, `type_word`, `version_word`) concatenated with the image
/// payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FirmwareHeader {
    pub checksum: u32,
    pub size: u32,
    pub type_word: u32,
    pub version_word: u32,
}

impl FirmwareHeader {
    pub fn image_type(&self) -> ImageType {
        ImageType(self.type_word)
    }

    pub fn set_image_type(&mut self, word: ImageType) {
        self.type_word = word.0;
    }

    pub fn version(&self) -> FwVersion {
        FwVersion(self.version_word)
    }

    pub fn set_version(&mut self, version: FwVersion) {
        self.version_word = version.0;
    }

    pub fn mem_kind(&self) -> Result<MemKind, ()> {
        MemKind::try_from(self.image_type().mem())
    }

    pub fn enc_kind(&self) -> Result<EncKind, ()> {
        EncKind::try_from(self.image_type().enc())
    }

    pub fn app_kind(&self) -> Result<AppKind, ()> {
        AppKind::try_from(self.image_type().app())
    }

    /// The 12 checksummed header bytes (everything after `checksum`).
    pub fn checked_prefix(&self) -> &[u8] {
        &self.as_bytes()[4..]
    }
}

/// One firmware slot as recorded in the MBR.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AppInfo {
    /// Image address: jump target for internal slots, storage offset for
    /// external ones.
    pub startup_addr: u32,
    /// Capacity of the slot's region.
    pub max_size: u32,
    pub fw_header: FirmwareHeader,
    pub status: u8,
    reserved: [u8; 3],
}

impl AppInfo {
    pub fn new(startup_addr: u32, max_size: u32, fw_header: FirmwareHeader, status: AppStatus) -> Self {
        AppInfo {
            startup_addr,
            max_size,
            fw_header,
            status: status as u8,
            reserved: [0; 3],
        }
    }

    pub fn app_status(&self) -> Result<AppStatus, ()> {
        AppStatus::try_from(self.status)
    }

    pub fn set_app_status(&mut self, status: AppStatus) {
        self.status = status as u8;
    }
}

bitfield! {
    /// The MBR `common` word: `startup_mode:u8 | dfu_mode:u8`, low lanes.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CommonWord(u32);
    impl Debug;
    u8;
    pub startup_mode, set_startup_mode: 7, 0;
    pub dfu_mode, set_dfu_mode: 15, 8;
}

/// Slot names in fixed record order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    Main,
    MainRollback,
    Boot,
    BootRollback,
    ImageDownload,
}

/// AES-128-CBC key material carried in the MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aes128Params {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// The master boot record, 196 bytes on flash.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MbrRecord {
    pub main_app: AppInfo,
    pub main_rollback: AppInfo,
    pub boot_app: AppInfo,
    pub boot_rollback: AppInfo,
    pub image_download: AppInfo,
    pub dfu_num_main: u16,
    pub dfu_num_boot: u16,
    pub hw_version: [u8; HW_VERSION_LEN],
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    pub common: u32,
}

impl MbrRecord {
    pub fn slot(&self, id: SlotId) -> &AppInfo {
        match id {
            SlotId::Main => &self.main_app,
            SlotId::MainRollback => &self.main_rollback,
            SlotId::Boot => &self.boot_app,
            SlotId::BootRollback => &self.boot_rollback,
            SlotId::ImageDownload => &self.image_download,
        }
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut AppInfo {
        match id {
            SlotId::Main => &mut self.main_app,
            SlotId::MainRollback => &mut self.main_rollback,
            SlotId::Boot => &mut self.boot_app,
            SlotId::BootRollback => &mut self.boot_rollback,
            SlotId::ImageDownload => &mut self.image_download,
        }
    }

    pub fn startup_mode(&self) -> Result<StartupMode, ()> {
        StartupMode::try_from(CommonWord(self.common).startup_mode())
    }

    pub fn set_startup_mode(&mut self, mode: StartupMode) {
        let mut word = CommonWord(self.common);
        word.set_startup_mode(mode as u8);
        self.common = word.0;
    }

    pub fn dfu_mode(&self) -> Result<DfuMode, ()> {
        DfuMode::try_from(CommonWord(self.common).dfu_mode())
    }

    pub fn set_dfu_mode(&mut self, mode: DfuMode) {
        let mut word = CommonWord(self.common);
        word.set_dfu_mode(mode as u8);
        self.common = word.0;
    }
}
