/*
    Model3

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    devices::fdc::controller.rs

    Implements the WD1793 floppy disk controller of the Model III.
*/

use std::{
    collections::VecDeque,
    fmt::Display,
    io::{Read, Seek, Write},
    path::Path,
};

use anyhow::{anyhow, Error};
use binrw::{BinRead, BinResult, BinWrite};

use crate::{
    bus::{IoDevice, NO_IO_BYTE},
    device_types::fdc::{
        sector_size_from_code,
        DAM_DELETED,
        DAM_NORMAL,
        FILLER_BYTE_DD,
        FILLER_BYTE_SD,
        SYNC_BYTE_DD,
        SYNC_BYTE_INDEX_DD,
    },
    devices::{
        fdc::{
            command::{
                Command,
                CommandType,
                DriveSelectLatch,
                InterruptFlags,
                TypeOneFlags,
                TypeTwoFlags,
                STEP_RATES_US,
            },
            status::FdcStatusSnapshot,
        },
        floppy_drive::FloppyDiskDrive,
    },
    floppy::{
        crc::{crc16, crc16_update, CRC_RESET, CRC_RESET_A1_A1_A1, CRC_RESET_A1_A1_A1_FE, CRC_RESET_FE},
        disk::FloppyDisk,
        track::{Track, DEFAULT_LENGTH_WITHOUT_HEADER},
    },
    machine_config::FloppyDriveConfig,
    snapshot::{FdcState, OperationState, TransferStateDto, SNAPSHOT_VERSION},
    timing::{PulseReq, TickRate},
};

pub const FDC_LOG_LEN: usize = 256;
pub const FDC_MAX_DRIVES: usize = 4;

pub const FDC_COMMAND_STATUS_PORT: u16 = 0xF0;
pub const FDC_TRACK_PORT: u16 = 0xF1;
pub const FDC_SECTOR_PORT: u16 = 0xF2;
pub const FDC_DATA_PORT: u16 = 0xF3;
pub const FDC_DRIVE_SELECT_PORT: u16 = 0xF4;

// Status Register Bit Definitions
// --------------------------------------------------------------------------------
// Bits 1, 2 and 5 change meaning between Type I and Type II/III commands.
pub const STATUS_BUSY: u8 = 0b0000_0001;
pub const STATUS_INDEX: u8 = 0b0000_0010;
pub const STATUS_DRQ: u8 = 0b0000_0010;
pub const STATUS_TRACK_ZERO: u8 = 0b0000_0100;
pub const STATUS_LOST_DATA: u8 = 0b0000_0100;
pub const STATUS_CRC_ERROR: u8 = 0b0000_1000;
pub const STATUS_SEEK_ERROR: u8 = 0b0001_0000;
pub const STATUS_RECORD_NOT_FOUND: u8 = 0b0001_0000;
pub const STATUS_HEAD_LOADED: u8 = 0b0010_0000;
pub const STATUS_RECORD_TYPE: u8 = 0b0010_0000;
pub const STATUS_WRITE_PROTECT: u8 = 0b0100_0000;
pub const STATUS_NOT_READY: u8 = 0b1000_0000;

/// One revolution at 300 RPM.
pub const REVOLUTION_US: u64 = 200_000;
pub const INDEX_PULSE_US: u64 = 4_000;
pub const HEAD_SETTLE_US: u64 = 15_000;
/// Time between a command register write and the first action of the command.
pub const COMMAND_DELAY_US: u64 = 20;
pub const MOTOR_OFF_DELAY_US: u64 = 2_000_000;
/// Revolutions an ID search may take before giving up.
pub const ID_SEARCH_REVOLUTIONS: u64 = 5;
pub const RESTORE_MAX_STEPS: u8 = 255;

// Byte times allowed for the host to supply the first byte of a sector write.
const WRITE_DRQ_GRACE_BYTES: usize = 2;
// IDAM, four ID bytes and the ID CRC.
const ID_FIELD_BYTES: usize = 7;
// Distance from the IDAM to the first data byte of a sector, in bytes.
const DATA_FIELD_OFFSET_DD: usize = 45;
const DATA_FIELD_OFFSET_SD: usize = 25;
const WRITE_GAP2_DD: usize = 22;
const WRITE_GAP2_SD: usize = 11;
const WRITE_SYNC_ZEROS_DD: usize = 12;
const WRITE_SYNC_ZEROS_SD: usize = 6;
// Bound on phases processed in one call to run(); a long catch-up is finished
// on the next call.
const MAX_PHASES_PER_RUN: usize = 16384;

/// Events carried by the controller's pulses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdcEvent {
    CommandPhase,
    MotorOff,
}

/// Phase of a command in progress.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::FromRepr)]
pub enum Phase {
    Seeking,
    Settling,
    SearchingId,
    TransferringData,
    Verifying,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ControllerState {
    #[default]
    Idle,
    Busy(Phase),
    /// Force Interrupt with the immediate flag; INTRQ is held until the next command.
    Interrupted,
}

impl Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Busy(phase) => write!(f, "Busy: {}", phase),
            ControllerState::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// The command in flight, with the parameters it needs to resume.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    NoOperation,
    Restore {
        verify: bool,
        step_rate: u8,
    },
    Seek {
        verify: bool,
        step_rate: u8,
    },
    Step {
        step_in: bool,
        update: bool,
        verify: bool,
        step_rate: u8,
    },
    ReadSector {
        multiple: bool,
        side: Option<bool>,
    },
    WriteSector {
        multiple: bool,
        side: Option<bool>,
        deleted: bool,
    },
    ReadAddress,
    ReadTrack,
    WriteTrack,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::NoOperation => write!(f, "No Operation"),
            Operation::Restore { .. } => write!(f, "Restore"),
            Operation::Seek { .. } => write!(f, "Seek"),
            Operation::Step { step_in: true, .. } => write!(f, "Step In"),
            Operation::Step { step_in: false, .. } => write!(f, "Step Out"),
            Operation::ReadSector { multiple: false, .. } => write!(f, "Read Sector"),
            Operation::ReadSector { multiple: true, .. } => write!(f, "Read Sectors"),
            Operation::WriteSector { multiple: false, .. } => write!(f, "Write Sector"),
            Operation::WriteSector { multiple: true, .. } => write!(f, "Write Sectors"),
            Operation::ReadAddress => write!(f, "Read Address"),
            Operation::ReadTrack => write!(f, "Read Track"),
            Operation::WriteTrack => write!(f, "Write Track"),
        }
    }
}

const OP_FLAG_VERIFY: u8 = 0x01;
const OP_FLAG_STEP_IN: u8 = 0x02;
const OP_FLAG_UPDATE: u8 = 0x04;
const OP_FLAG_MULTIPLE: u8 = 0x08;
const OP_FLAG_SIDE_COMPARE: u8 = 0x10;
const OP_FLAG_SIDE: u8 = 0x20;
const OP_FLAG_DELETED: u8 = 0x40;

impl Operation {
    fn verify(&self) -> bool {
        matches!(
            self,
            Operation::Restore { verify: true, .. }
                | Operation::Seek { verify: true, .. }
                | Operation::Step { verify: true, .. }
        )
    }

    fn to_state(self) -> OperationState {
        let side_flags = |side: Option<bool>| match side {
            Some(true) => OP_FLAG_SIDE_COMPARE | OP_FLAG_SIDE,
            Some(false) => OP_FLAG_SIDE_COMPARE,
            None => 0,
        };
        let flag = |set: bool, bit: u8| if set { bit } else { 0 };
        let (kind, flags, step_rate) = match self {
            Operation::NoOperation => (0, 0, 0),
            Operation::Restore { verify, step_rate } => (1, flag(verify, OP_FLAG_VERIFY), step_rate),
            Operation::Seek { verify, step_rate } => (2, flag(verify, OP_FLAG_VERIFY), step_rate),
            Operation::Step {
                step_in,
                update,
                verify,
                step_rate,
            } => (
                3,
                flag(verify, OP_FLAG_VERIFY) | flag(step_in, OP_FLAG_STEP_IN) | flag(update, OP_FLAG_UPDATE),
                step_rate,
            ),
            Operation::ReadSector { multiple, side } => (4, flag(multiple, OP_FLAG_MULTIPLE) | side_flags(side), 0),
            Operation::WriteSector {
                multiple,
                side,
                deleted,
            } => (
                5,
                flag(multiple, OP_FLAG_MULTIPLE) | side_flags(side) | flag(deleted, OP_FLAG_DELETED),
                0,
            ),
            Operation::ReadAddress => (6, 0, 0),
            Operation::ReadTrack => (7, 0, 0),
            Operation::WriteTrack => (8, 0, 0),
        };
        OperationState { kind, flags, step_rate }
    }

    fn from_state(state: &OperationState) -> Option<Self> {
        let has = |bit: u8| state.flags & bit != 0;
        let side = has(OP_FLAG_SIDE_COMPARE).then(|| has(OP_FLAG_SIDE));
        let step_rate = state.step_rate & 0x03;
        Some(match state.kind {
            0 => Operation::NoOperation,
            1 => Operation::Restore {
                verify: has(OP_FLAG_VERIFY),
                step_rate,
            },
            2 => Operation::Seek {
                verify: has(OP_FLAG_VERIFY),
                step_rate,
            },
            3 => Operation::Step {
                step_in: has(OP_FLAG_STEP_IN),
                update: has(OP_FLAG_UPDATE),
                verify: has(OP_FLAG_VERIFY),
                step_rate,
            },
            4 => Operation::ReadSector {
                multiple: has(OP_FLAG_MULTIPLE),
                side,
            },
            5 => Operation::WriteSector {
                multiple: has(OP_FLAG_MULTIPLE),
                side,
                deleted: has(OP_FLAG_DELETED),
            },
            6 => Operation::ReadAddress,
            7 => Operation::ReadTrack,
            8 => Operation::WriteTrack,
            _ => return None,
        })
    }
}

/// Resume data of the command in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Head position within the track, in bitstream bytes.
    pub position: usize,
    /// Tick at which an ID search gives up.
    pub search_deadline: u64,
    /// IDAM the search is heading for, or of the sector being transferred.
    pub idam: Option<usize>,
    pub buffer: Vec<u8>,
    pub cursor: usize,
    pub sector_len: usize,
    pub crc: u16,
    pub crc_error: bool,
    pub deleted: bool,
    pub last_was_f5: bool,
    pub steps: u8,
}

impl TransferState {
    fn to_dto(&self) -> TransferStateDto {
        let flags = (self.crc_error as u8) | (self.deleted as u8) << 1 | (self.last_was_f5 as u8) << 2;
        TransferStateDto {
            position: self.position as u32,
            search_deadline: self.search_deadline,
            idam: self.idam.map_or(u32::MAX, |i| i as u32),
            buffer_len: self.buffer.len() as u32,
            buffer: self.buffer.clone(),
            cursor: self.cursor as u32,
            sector_len: self.sector_len as u32,
            crc: self.crc,
            flags,
            steps: self.steps,
        }
    }

    fn from_dto(dto: &TransferStateDto) -> Self {
        Self {
            position: dto.position as usize,
            search_deadline: dto.search_deadline,
            idam: (dto.idam != u32::MAX).then_some(dto.idam as usize),
            buffer: dto.buffer.clone(),
            cursor: dto.cursor as usize,
            sector_len: dto.sector_len as usize,
            crc: dto.crc,
            crc_error: dto.flags & 0x01 != 0,
            deleted: dto.flags & 0x02 != 0,
            last_was_f5: dto.flags & 0x04 != 0,
            steps: dto.steps,
        }
    }
}

/// The in-flight command: what is being done and where it has got to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandState {
    pub operation: Operation,
    pub xfer: TransferState,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct StatusFlags {
    busy: bool,
    drq: bool,
    seek_error: bool,
    crc_error: bool,
    lost_data: bool,
    write_protect: bool,
    not_ready: bool,
    record_type: bool,
    head_loaded: bool,
}

impl StatusFlags {
    fn to_bits(self) -> u16 {
        [
            self.busy,
            self.drq,
            self.seek_error,
            self.crc_error,
            self.lost_data,
            self.write_protect,
            self.not_ready,
            self.record_type,
            self.head_loaded,
        ]
        .iter()
        .enumerate()
        .fold(0, |bits, (i, &set)| bits | (set as u16) << i)
    }

    fn from_bits(bits: u16) -> Self {
        let bit = |i: u16| bits & (1 << i) != 0;
        Self {
            busy: bit(0),
            drq: bit(1),
            seek_error: bit(2),
            crc_error: bit(3),
            lost_data: bit(4),
            write_protect: bit(5),
            not_ready: bit(6),
            record_type: bit(7),
            head_loaded: bit(8),
        }
    }
}

/// A decoded ID field.
#[derive(Copy, Clone, Debug)]
struct IdField {
    bytes: [u8; 6],
    crc_ok: bool,
}

impl IdField {
    fn track(&self) -> u8 {
        self.bytes[0]
    }
    fn side(&self) -> u8 {
        self.bytes[1]
    }
    fn sector(&self) -> u8 {
        self.bytes[2]
    }
    fn size_code(&self) -> u8 {
        self.bytes[3]
    }
}

pub struct FloppyController {
    rate: TickRate,
    state: ControllerState,
    command: CommandState,
    command_pulse: PulseReq<FdcEvent>,
    motor_off_pulse: PulseReq<FdcEvent>,

    command_register: u8,
    track_register: u8,
    sector_register: u8,
    data_register: u8,
    status: StatusFlags,
    last_type: CommandType,
    step_in: bool,
    intrq: bool,

    drive_select: usize,
    side_one: bool,
    double_density: bool,
    wait_enabled: bool,
    drives: Vec<FloppyDiskDrive>,

    cmd_log: VecDeque<String>,
}

/// IO Port handlers for the FDC
impl IoDevice for FloppyController {
    fn read_u8(&mut self, port: u16, now: u64) -> u8 {
        self.run(now);
        match port {
            FDC_COMMAND_STATUS_PORT => {
                let status = self.status_register(now);
                if self.state != ControllerState::Interrupted {
                    self.intrq = false;
                }
                status
            }
            FDC_TRACK_PORT => self.track_register,
            FDC_SECTOR_PORT => self.sector_register,
            FDC_DATA_PORT => {
                self.status.drq = false;
                self.data_register
            }
            FDC_DRIVE_SELECT_PORT => {
                log::warn!("Read from write-only drive select latch");
                NO_IO_BYTE
            }
            _ => {
                log::warn!("Read from invalid FDC port: {:04X}", port);
                NO_IO_BYTE
            }
        }
    }

    fn write_u8(&mut self, port: u16, data: u8, now: u64) {
        self.run(now);
        match port {
            FDC_COMMAND_STATUS_PORT => self.write_command(data, now),
            FDC_TRACK_PORT => {
                if self.status.busy {
                    log::warn!("Track register written while busy: {:02X}", data);
                }
                self.track_register = data;
            }
            FDC_SECTOR_PORT => {
                if self.status.busy {
                    log::warn!("Sector register written while busy: {:02X}", data);
                }
                self.sector_register = data;
            }
            FDC_DATA_PORT => {
                self.data_register = data;
                self.status.drq = false;
            }
            FDC_DRIVE_SELECT_PORT => self.write_drive_select(data, now),
            _ => log::warn!("Write to invalid FDC port: {:04X}", port),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("FDC Command/Status Register"), FDC_COMMAND_STATUS_PORT),
            (String::from("FDC Track Register"), FDC_TRACK_PORT),
            (String::from("FDC Sector Register"), FDC_SECTOR_PORT),
            (String::from("FDC Data Register"), FDC_DATA_PORT),
            (String::from("Drive Select Latch"), FDC_DRIVE_SELECT_PORT),
        ]
    }
}

impl FloppyController {
    pub fn new(rate: TickRate, drive_configs: &[FloppyDriveConfig]) -> Self {
        let drives = (0..FDC_MAX_DRIVES)
            .map(|n| {
                let drive_type = drive_configs.get(n).map(|c| c.fd_type).unwrap_or_default();
                let mut drive = FloppyDiskDrive::new(n, drive_type);
                if let Some(config) = drive_configs.get(n) {
                    drive.set_write_protect(config.write_protect);
                }
                drive
            })
            .collect();

        Self {
            rate,
            state: ControllerState::Idle,
            command: CommandState::default(),
            command_pulse: PulseReq::new(COMMAND_DELAY_US, FdcEvent::CommandPhase, true),
            motor_off_pulse: PulseReq::new(MOTOR_OFF_DELAY_US, FdcEvent::MotorOff, true),
            command_register: 0,
            track_register: 0,
            sector_register: 0,
            data_register: 0,
            status: StatusFlags::default(),
            last_type: CommandType::TypeI,
            step_in: true,
            intrq: false,
            drive_select: 0,
            side_one: false,
            double_density: false,
            wait_enabled: false,
            drives,
            cmd_log: VecDeque::with_capacity(FDC_LOG_LEN),
        }
    }

    /// Reset the controller: registers cleared, commands and timers cancelled
    /// and every head returned to track 0. Mounted disks are kept.
    pub fn reset(&mut self) {
        self.state = ControllerState::Idle;
        self.command = CommandState::default();
        self.command_pulse.expire();
        self.motor_off_pulse.expire();
        self.command_register = 0;
        self.track_register = 0;
        self.sector_register = 0;
        self.data_register = 0;
        self.status = StatusFlags::default();
        self.last_type = CommandType::TypeI;
        self.step_in = true;
        self.intrq = false;
        self.drive_select = 0;
        self.side_one = false;
        self.double_density = false;
        self.wait_enabled = false;
        for drive in self.drives.iter_mut() {
            drive.reset();
        }
        self.log_str("FDC Reset!");
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn operation(&self) -> Operation {
        self.command.operation
    }

    pub fn busy(&self) -> bool {
        self.status.busy
    }

    pub fn drq(&self) -> bool {
        self.status.drq
    }

    pub fn intrq(&self) -> bool {
        self.intrq
    }

    pub fn wait_enabled(&self) -> bool {
        self.wait_enabled
    }

    pub fn track_register(&self) -> u8 {
        self.track_register
    }

    pub fn sector_register(&self) -> u8 {
        self.sector_register
    }

    pub fn drive(&self, drive_n: usize) -> Option<&FloppyDiskDrive> {
        self.drives.get(drive_n)
    }

    pub fn drive_mut(&mut self, drive_n: usize) -> Option<&mut FloppyDiskDrive> {
        self.drives.get_mut(drive_n)
    }

    pub fn drive_ct(&self) -> usize {
        self.drives.len()
    }

    /// Put a disk in a drive. A command in progress on that drive is abandoned.
    pub fn attach_disk(&mut self, drive_n: usize, disk: FloppyDisk, write_protect: bool) -> Result<(), Error> {
        if drive_n >= self.drives.len() {
            return Err(anyhow!("Invalid drive: {}", drive_n));
        }
        self.abort_if_selected(drive_n);
        self.drives[drive_n].attach_disk(disk, write_protect);
        Ok(())
    }

    /// Load a DMK image into a drive.
    pub fn load_image_from(
        &mut self,
        drive_n: usize,
        src_vec: Vec<u8>,
        path: Option<&Path>,
        write_protect: bool,
    ) -> Result<(), Error> {
        if drive_n >= self.drives.len() {
            return Err(anyhow!("Invalid drive: {}", drive_n));
        }
        self.abort_if_selected(drive_n);
        self.drives[drive_n].load_image_from(src_vec, path, write_protect)
    }

    pub fn unload_image(&mut self, drive_n: usize) -> Option<FloppyDisk> {
        if drive_n >= self.drives.len() {
            return None;
        }
        self.abort_if_selected(drive_n);
        self.drives[drive_n].unload_image()
    }

    fn abort_if_selected(&mut self, drive_n: usize) {
        if self.status.busy && drive_n == self.drive_select {
            self.log_str(&format!(
                "Disk change in drive {}: abandoning {}",
                drive_n, self.command.operation
            ));
            self.command_pulse.expire();
            self.command = CommandState::default();
            self.status.busy = false;
            self.status.drq = false;
            self.state = ControllerState::Idle;
        }
    }

    /// Process any pulses that have come due by tick `now`.
    pub fn run(&mut self, now: u64) {
        if let Some(FdcEvent::MotorOff) = self.motor_off_pulse.poll(now) {
            self.motor_off();
        }

        let mut phases = 0;
        while self.command_pulse.is_due(now) {
            let at = self.command_pulse.trigger();
            if let Some(FdcEvent::CommandPhase) = self.command_pulse.execute() {
                self.advance(at);
            }
            phases += 1;
            if phases >= MAX_PHASES_PER_RUN {
                log::warn!("FDC: phase limit reached in one run, deferring remainder");
                break;
            }
        }
    }

    fn advance(&mut self, at: u64) {
        let ControllerState::Busy(phase) = self.state
        else {
            return;
        };
        match phase {
            Phase::Seeking => self.phase_seek(at),
            Phase::Settling => self.phase_settled(at),
            Phase::SearchingId => self.phase_search(at),
            Phase::TransferringData => self.phase_transfer(at),
            Phase::Verifying => self.phase_verify(at),
        }
    }

    fn schedule(&mut self, at: u64, delay_us: u64) {
        self.command_pulse.arm(delay_us, at, self.rate);
    }

    fn enter(&mut self, phase: Phase, at: u64, delay_us: u64) {
        self.state = ControllerState::Busy(phase);
        self.schedule(at, delay_us);
    }

    fn selected_drive(&self) -> &FloppyDiskDrive {
        &self.drives[self.drive_select]
    }

    fn selected_drive_mut(&mut self) -> &mut FloppyDiskDrive {
        &mut self.drives[self.drive_select]
    }

    fn selected_track(&self) -> Option<&Track> {
        self.drives[self.drive_select].track(self.side_one)
    }

    fn selected_track_mut(&mut self) -> Option<&mut Track> {
        let side_one = self.side_one;
        self.drives[self.drive_select].track_mut(side_one)
    }

    /// Bitstream bytes per data byte at the current density.
    fn unit(&self) -> usize {
        if self.double_density {
            1
        }
        else {
            2
        }
    }

    fn track_len(&self) -> usize {
        self.selected_track()
            .map_or(DEFAULT_LENGTH_WITHOUT_HEADER, |t| t.len())
            .max(1)
    }

    /// Time for `units` bitstream bytes to pass under the head.
    fn units_to_us(&self, units: usize) -> u64 {
        (units as u64 * REVOLUTION_US).div_ceil(self.track_len() as u64)
    }

    fn rotation_us(&self, now: u64) -> u64 {
        self.rate.ticks_to_us(now) % REVOLUTION_US
    }

    /// Byte offset under the head at tick `now`.
    fn position_at(&self, now: u64) -> usize {
        (self.rotation_us(now) * self.track_len() as u64 / REVOLUTION_US) as usize
    }

    fn us_to_index(&self, now: u64) -> u64 {
        REVOLUTION_US - self.rotation_us(now)
    }

    fn index_hole(&self, now: u64) -> bool {
        let drive = self.selected_drive();
        drive.disk_present() && drive.motor_on() && self.rotation_us(now) < INDEX_PULSE_US
    }

    fn disk_angle(&self, now: u64) -> f64 {
        self.rotation_us(now) as f64 * 360.0 / REVOLUTION_US as f64
    }

    fn spin_up(&mut self, now: u64) {
        self.selected_drive_mut().motor_on = true;
        self.motor_off_pulse.set_trigger(now, self.rate);
    }

    fn motor_off(&mut self) {
        for drive in self.drives.iter_mut() {
            drive.motor_on = false;
        }
        self.log_str("Motor off");
    }

    fn write_drive_select(&mut self, data: u8, now: u64) {
        let latch = DriveSelectLatch::from_bytes([data]);
        if let Some(drive_n) = latch.selected_drive() {
            if drive_n != self.drive_select && self.status.busy {
                log::warn!("Drive {} selected while busy with {}", drive_n, self.command.operation);
            }
            self.drive_select = drive_n;
        }
        self.side_one = latch.side_one();
        self.double_density = latch.double_density();
        self.wait_enabled = latch.wait();
        self.spin_up(now);
        log::trace!(
            "Drive select {:02X}: drive {} side {} {}",
            data,
            self.drive_select,
            self.side_one as u8,
            if self.double_density { "MFM" } else { "FM" }
        );
    }

    fn status_register(&self, now: u64) -> u8 {
        let drive = self.selected_drive();
        let mut status = 0;

        if !drive.disk_present() || self.status.not_ready {
            status |= STATUS_NOT_READY;
        }
        match self.last_type {
            CommandType::TypeI | CommandType::TypeIV => {
                if drive.is_write_protected() {
                    status |= STATUS_WRITE_PROTECT;
                }
                if self.status.head_loaded {
                    status |= STATUS_HEAD_LOADED;
                }
                if self.status.seek_error {
                    status |= STATUS_SEEK_ERROR;
                }
                if self.status.crc_error {
                    status |= STATUS_CRC_ERROR;
                }
                if drive.track_zero() {
                    status |= STATUS_TRACK_ZERO;
                }
                if self.index_hole(now) {
                    status |= STATUS_INDEX;
                }
            }
            CommandType::TypeII | CommandType::TypeIII => {
                if self.status.write_protect {
                    status |= STATUS_WRITE_PROTECT;
                }
                if self.status.record_type {
                    status |= STATUS_RECORD_TYPE;
                }
                if self.status.seek_error {
                    status |= STATUS_RECORD_NOT_FOUND;
                }
                if self.status.crc_error {
                    status |= STATUS_CRC_ERROR;
                }
                if self.status.lost_data {
                    status |= STATUS_LOST_DATA;
                }
                if self.status.drq {
                    status |= STATUS_DRQ;
                }
            }
        }
        if self.status.busy {
            status |= STATUS_BUSY;
        }
        status
    }

    fn write_command(&mut self, data: u8, now: u64) {
        let command = Command::from(data);

        if command == Command::ForceInterrupt {
            self.force_interrupt(data);
            return;
        }
        if self.status.busy {
            log::warn!("Command {:02X} ignored: {} in progress", data, self.command.operation);
            return;
        }

        self.command_register = data;
        self.intrq = false;
        self.state = ControllerState::Idle;
        self.status = StatusFlags {
            busy: true,
            head_loaded: self.status.head_loaded,
            ..Default::default()
        };
        self.last_type = command.command_type();
        self.command.xfer = TransferState::default();
        self.spin_up(now);

        self.log_str(&format!(
            "{} ({:02X}): drive {} side {} track {} sector {} data {}",
            command,
            data,
            self.drive_select,
            self.side_one as u8,
            self.track_register,
            self.sector_register,
            self.data_register
        ));

        match command {
            Command::Restore | Command::Seek | Command::Step | Command::StepIn | Command::StepOut => {
                let flags = TypeOneFlags::from_bytes([data]);
                let verify = flags.verify();
                let step_rate = flags.step_rate();
                self.status.head_loaded = flags.head_load();
                self.command.operation = match command {
                    Command::Restore => Operation::Restore { verify, step_rate },
                    Command::Seek => Operation::Seek { verify, step_rate },
                    _ => {
                        if command == Command::StepIn {
                            self.step_in = true;
                        }
                        else if command == Command::StepOut {
                            self.step_in = false;
                        }
                        Operation::Step {
                            step_in: self.step_in,
                            update: flags.update(),
                            verify,
                            step_rate,
                        }
                    }
                };
                self.enter(Phase::Seeking, now, COMMAND_DELAY_US);
            }
            Command::ReadSector | Command::WriteSector | Command::ReadAddress | Command::ReadTrack | Command::WriteTrack => {
                if !self.selected_drive().disk_present() {
                    self.status.not_ready = true;
                    self.finish_command("drive not ready");
                    return;
                }

                let flags = TypeTwoFlags::from_bytes([data]);
                let side = flags.side_compare().then_some(flags.side());
                let writes = matches!(command, Command::WriteSector | Command::WriteTrack);
                if writes && self.selected_drive().is_write_protected() {
                    self.status.write_protect = true;
                    self.finish_command("write protected");
                    return;
                }

                self.command.operation = match command {
                    Command::ReadSector => Operation::ReadSector {
                        multiple: flags.multiple(),
                        side,
                    },
                    Command::WriteSector => Operation::WriteSector {
                        multiple: flags.multiple(),
                        side,
                        deleted: flags.deleted_mark(),
                    },
                    Command::ReadAddress => Operation::ReadAddress,
                    Command::ReadTrack => Operation::ReadTrack,
                    _ => Operation::WriteTrack,
                };
                self.status.head_loaded = true;
                let delay = if flags.settle_delay() {
                    HEAD_SETTLE_US
                }
                else {
                    COMMAND_DELAY_US
                };
                self.enter(Phase::Settling, now, delay);
            }
            Command::ForceInterrupt => {}
        }
    }

    fn force_interrupt(&mut self, data: u8) {
        let flags = InterruptFlags::from_bytes([data]);
        let was_busy = self.status.busy;

        self.command_pulse.expire();
        self.command = CommandState::default();
        self.command_register = data;
        self.status.busy = false;
        if !was_busy {
            self.last_type = CommandType::TypeIV;
            self.status.drq = false;
        }

        if flags.index_pulse() || flags.not_ready_to_ready() || flags.ready_to_not_ready() {
            log::debug!("Force interrupt conditions {:02X} not modelled", data & 0x07);
        }

        if flags.immediate() {
            self.intrq = true;
            self.state = ControllerState::Interrupted;
        }
        else {
            self.intrq = false;
            self.state = ControllerState::Idle;
        }
        self.log_str(&format!(
            "Force Interrupt ({:02X}){}",
            data,
            if was_busy { ": command terminated" } else { "" }
        ));
    }

    fn finish_command(&mut self, reason: &str) {
        self.command_pulse.expire();
        self.status.busy = false;
        self.state = ControllerState::Idle;
        self.intrq = true;
        let operation = self.command.operation;
        self.command = CommandState::default();
        let status = self.status_register(0) & !STATUS_INDEX;
        self.log_str(&format!("{} complete ({}): status {:02X}", operation, reason, status));
    }

    fn phase_seek(&mut self, at: u64) {
        match self.command.operation {
            Operation::Restore { step_rate, .. } => {
                if self.selected_drive().track_zero() {
                    self.track_register = 0;
                    self.seek_complete(at);
                    return;
                }
                if self.command.xfer.steps == RESTORE_MAX_STEPS {
                    self.status.seek_error = true;
                    self.finish_command("track 0 not found");
                    return;
                }
                self.command.xfer.steps += 1;
                self.step_in = false;
                self.selected_drive_mut().step(false);
                self.schedule(at, STEP_RATES_US[step_rate as usize]);
            }
            Operation::Seek { step_rate, .. } => {
                if self.track_register == self.data_register {
                    self.seek_complete(at);
                    return;
                }
                let step_in = self.data_register > self.track_register;
                self.step_in = step_in;
                self.track_register = if step_in {
                    self.track_register.wrapping_add(1)
                }
                else {
                    self.track_register.wrapping_sub(1)
                };
                if !self.selected_drive_mut().step(step_in) {
                    self.status.seek_error = true;
                    self.finish_command("stepped past last track");
                    return;
                }
                self.schedule(at, STEP_RATES_US[step_rate as usize]);
            }
            Operation::Step {
                step_in,
                update,
                step_rate,
                ..
            } => {
                if self.command.xfer.steps > 0 {
                    self.seek_complete(at);
                    return;
                }
                self.command.xfer.steps = 1;
                if update {
                    self.track_register = if step_in {
                        self.track_register.wrapping_add(1)
                    }
                    else {
                        self.track_register.wrapping_sub(1)
                    };
                }
                if !self.selected_drive_mut().step(step_in) {
                    self.status.seek_error = true;
                    self.finish_command("stepped past last track");
                    return;
                }
                self.schedule(at, STEP_RATES_US[step_rate as usize]);
            }
            operation => {
                log::error!("Seeking phase entered by {}", operation);
                self.finish_command("invalid phase");
            }
        }
    }

    fn seek_complete(&mut self, at: u64) {
        if self.command.operation.verify() {
            self.status.head_loaded = true;
            self.enter(Phase::Settling, at, HEAD_SETTLE_US);
        }
        else {
            self.finish_command("seek complete");
        }
    }

    fn phase_settled(&mut self, at: u64) {
        match self.command.operation {
            Operation::ReadTrack | Operation::WriteTrack => {
                if self.command.operation == Operation::WriteTrack {
                    self.status.drq = true;
                }
                let delay = self.us_to_index(at);
                self.enter(Phase::SearchingId, at, delay);
            }
            _ => self.begin_id_search(at),
        }
    }

    fn begin_id_search(&mut self, at: u64) {
        self.state = ControllerState::Busy(Phase::SearchingId);
        self.command.xfer.search_deadline = at + self.rate.us_to_ticks(ID_SEARCH_REVOLUTIONS * REVOLUTION_US);
        self.command.xfer.position = self.position_at(at);
        self.search_next_id(at);
    }

    /// Schedule arrival at the end of the next ID field of the current density,
    /// or at the search deadline if none can be reached before it.
    fn search_next_id(&mut self, at: u64) {
        let dd = self.double_density;
        let unit = self.unit();
        let position = self.command.xfer.position;
        let deadline = self.command.xfer.search_deadline;

        let next = self.selected_track_mut().and_then(|track| {
            let len = track.len();
            track
                .idams()
                .into_iter()
                .filter(|&(_, idam_dd)| idam_dd == dd)
                .map(|(offset, _)| {
                    let distance = if offset > position {
                        offset - position
                    }
                    else {
                        len.saturating_sub(position) + offset
                    };
                    (distance, offset, len)
                })
                .min()
        });

        if let Some((distance, offset, len)) = next {
            let delay = self.units_to_us(distance + ID_FIELD_BYTES * unit);
            if at + self.rate.us_to_ticks(delay) <= deadline {
                self.command.xfer.idam = Some(offset);
                self.command.xfer.position = (offset + ID_FIELD_BYTES * unit) % len;
                self.schedule(at, delay);
                return;
            }
        }

        self.command.xfer.idam = None;
        let remaining = self.rate.ticks_to_us(deadline.saturating_sub(at));
        self.schedule(at, remaining);
    }

    fn read_id_field(&mut self, idam: usize) -> Option<IdField> {
        let dd = self.double_density;
        let unit = self.unit();
        let track = self.selected_track_mut()?;
        if !track.has_idam_at(idam, dd) {
            return None;
        }
        let bytes: [u8; 6] = std::array::from_fn(|k| track.read_byte(idam + (k + 1) * unit, Some(dd)));
        let seed = if dd { CRC_RESET_A1_A1_A1_FE } else { CRC_RESET_FE };
        let crc_ok = crc16(seed, &bytes[..4]) == u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(IdField { bytes, crc_ok })
    }

    fn phase_search(&mut self, at: u64) {
        if matches!(self.command.operation, Operation::ReadTrack | Operation::WriteTrack) {
            self.index_reached(at);
            return;
        }

        let Some(idam) = self.command.xfer.idam.take()
        else {
            self.status.seek_error = true;
            self.finish_command("record not found");
            return;
        };
        let Some(id) = self.read_id_field(idam)
        else {
            self.search_next_id(at);
            return;
        };

        match self.command.operation {
            Operation::Restore { .. } | Operation::Seek { .. } | Operation::Step { .. } => {
                if id.track() != self.track_register {
                    self.search_next_id(at);
                }
                else if !id.crc_ok {
                    self.status.crc_error = true;
                    self.search_next_id(at);
                }
                else {
                    self.status.crc_error = false;
                    self.finish_command("verified");
                }
            }
            Operation::ReadSector { side, .. } | Operation::WriteSector { side, .. } => {
                let side_ok = side.map_or(true, |s| (id.side() & 0x01 != 0) == s);
                if id.track() != self.track_register || id.sector() != self.sector_register || !side_ok {
                    self.search_next_id(at);
                }
                else if !id.crc_ok {
                    self.status.crc_error = true;
                    self.search_next_id(at);
                }
                else {
                    self.status.crc_error = false;
                    self.begin_data(at, idam, id);
                }
            }
            Operation::ReadAddress => {
                self.sector_register = id.track();
                let xfer = &mut self.command.xfer;
                xfer.buffer = id.bytes.to_vec();
                xfer.cursor = 0;
                xfer.crc_error = !id.crc_ok;
                self.enter(Phase::TransferringData, at, 0);
            }
            operation => {
                log::error!("ID search entered by {}", operation);
                self.finish_command("invalid phase");
            }
        }
    }

    fn begin_data(&mut self, at: u64, idam: usize, id: IdField) {
        let dd = self.double_density;
        let unit = self.unit();
        self.command.xfer.idam = Some(idam);

        match self.command.operation {
            Operation::ReadSector { .. } => {
                let Some(sector) = self.selected_track_mut().map(|t| t.sector_at(idam, dd))
                else {
                    self.status.seek_error = true;
                    self.finish_command("track missing");
                    return;
                };
                if sector.dam == 0 {
                    // No data address mark followed the ID field.
                    self.status.seek_error = true;
                    self.finish_command("no data address mark");
                    return;
                }
                let offset = if dd { DATA_FIELD_OFFSET_DD } else { DATA_FIELD_OFFSET_SD };
                let xfer = &mut self.command.xfer;
                xfer.deleted = sector.deleted();
                xfer.crc_error = sector.crc_error;
                xfer.buffer = sector.sector_data;
                xfer.cursor = 0;
                xfer.position += (offset - ID_FIELD_BYTES) * unit;
                let delay = self.units_to_us((offset - ID_FIELD_BYTES) * unit);
                self.enter(Phase::TransferringData, at, delay);
            }
            Operation::WriteSector { .. } => {
                let xfer = &mut self.command.xfer;
                xfer.sector_len = sector_size_from_code(id.size_code());
                xfer.buffer = Vec::with_capacity(xfer.sector_len);
                xfer.cursor = 0;
                self.status.drq = true;
                let delay = self.units_to_us(WRITE_DRQ_GRACE_BYTES * unit);
                self.enter(Phase::TransferringData, at, delay);
            }
            operation => {
                log::error!("Data phase entered by {}", operation);
                self.finish_command("invalid phase");
            }
        }
    }

    fn index_reached(&mut self, at: u64) {
        if self.command.operation == Operation::WriteTrack && self.status.drq {
            self.status.lost_data = true;
            self.finish_command("no data before index");
            return;
        }
        let xfer = &mut self.command.xfer;
        xfer.position = 0;
        xfer.crc = CRC_RESET;
        xfer.last_was_f5 = false;
        self.enter(Phase::TransferringData, at, 0);
    }

    fn phase_transfer(&mut self, at: u64) {
        let unit = self.unit();
        match self.command.operation {
            Operation::ReadSector { .. } | Operation::ReadAddress => {
                let xfer = &mut self.command.xfer;
                let Some(&byte) = xfer.buffer.get(xfer.cursor)
                else {
                    self.enter(Phase::Verifying, at, 0);
                    return;
                };
                xfer.cursor += 1;
                let done = xfer.cursor >= xfer.buffer.len();
                if self.status.drq {
                    self.status.lost_data = true;
                }
                self.data_register = byte;
                self.status.drq = true;

                if done {
                    // The remaining data CRC passes under the head.
                    let crc_units = if self.command.operation == Operation::ReadAddress { 0 } else { 2 * unit };
                    let delay = self.units_to_us(crc_units + unit);
                    self.enter(Phase::Verifying, at, delay);
                }
                else {
                    let delay = self.units_to_us(unit);
                    self.schedule(at, delay);
                }
            }
            Operation::WriteSector { .. } => {
                if self.command.xfer.buffer.is_empty() && self.status.drq {
                    self.status.lost_data = true;
                    self.finish_command("no data for sector write");
                    return;
                }
                let byte = if self.status.drq {
                    self.status.lost_data = true;
                    0
                }
                else {
                    self.data_register
                };
                let xfer = &mut self.command.xfer;
                xfer.buffer.push(byte);

                if xfer.buffer.len() < xfer.sector_len {
                    self.status.drq = true;
                    let delay = self.units_to_us(unit);
                    self.schedule(at, delay);
                }
                else {
                    self.write_data_field();
                    let delay = self.units_to_us(2 * unit);
                    self.enter(Phase::Verifying, at, delay);
                }
            }
            Operation::ReadTrack => {
                let dd = self.double_density;
                let position = self.command.xfer.position;
                let len = self.track_len();
                let byte = self
                    .selected_track()
                    .map_or(0, |t| t.read_byte(position, Some(dd)));
                if self.status.drq {
                    self.status.lost_data = true;
                }
                self.data_register = byte;
                self.status.drq = true;
                self.command.xfer.position += unit;

                let delay = self.units_to_us(unit);
                if self.command.xfer.position >= len {
                    self.enter(Phase::Verifying, at, delay);
                }
                else {
                    self.schedule(at, delay);
                }
            }
            Operation::WriteTrack => {
                let byte = if self.status.drq {
                    self.status.lost_data = true;
                    0
                }
                else {
                    self.data_register
                };
                let written = self.write_track_byte(byte);
                let len = self.track_len();
                let delay = self.units_to_us(written * unit);

                if self.command.xfer.position >= len {
                    self.status.drq = false;
                    if let Some(track) = self.selected_track_mut() {
                        track.normalize_density();
                    }
                    self.enter(Phase::Verifying, at, delay);
                }
                else {
                    self.status.drq = true;
                    self.schedule(at, delay);
                }
            }
            operation => {
                log::error!("Transfer phase entered by {}", operation);
                self.finish_command("invalid phase");
            }
        }
    }

    /// Translate one byte of a Write Track stream and write it at the head.
    /// Returns the number of bytes put on the track.
    fn write_track_byte(&mut self, byte: u8) -> usize {
        let dd = self.double_density;
        let unit = self.unit();
        let xfer = &mut self.command.xfer;

        let mut out = [0u8; 2];
        let count = if dd {
            let count = match byte {
                0xF5 => {
                    if !xfer.last_was_f5 {
                        xfer.crc = CRC_RESET;
                    }
                    xfer.crc = crc16_update(xfer.crc, SYNC_BYTE_DD);
                    out[0] = SYNC_BYTE_DD;
                    1
                }
                0xF6 => {
                    out[0] = SYNC_BYTE_INDEX_DD;
                    1
                }
                0xF7 => {
                    out = xfer.crc.to_be_bytes();
                    2
                }
                b => {
                    xfer.crc = crc16_update(xfer.crc, b);
                    out[0] = b;
                    1
                }
            };
            xfer.last_was_f5 = byte == 0xF5;
            count
        }
        else {
            match byte {
                0xF7 => {
                    out = xfer.crc.to_be_bytes();
                    2
                }
                0xF8..=0xFB | 0xFE => {
                    xfer.crc = crc16_update(CRC_RESET, byte);
                    out[0] = byte;
                    1
                }
                b => {
                    xfer.crc = crc16_update(xfer.crc, b);
                    out[0] = b;
                    1
                }
            }
        };

        let mut position = self.command.xfer.position;
        if let Some(track) = self.selected_track_mut() {
            let len = track.len();
            for &b in &out[..count] {
                if position >= len {
                    break;
                }
                track.write_byte(position, dd, b);
                position += unit;
            }
        }
        else {
            position += count * unit;
        }
        self.command.xfer.position = position;
        count
    }

    /// Write sync, data address mark, the sector buffer and its CRC after the
    /// ID field of the sector being written.
    fn write_data_field(&mut self) {
        let dd = self.double_density;
        let unit = self.unit();
        let Some(idam) = self.command.xfer.idam
        else {
            log::error!("Sector write with no ID field");
            return;
        };
        let deleted = matches!(self.command.operation, Operation::WriteSector { deleted: true, .. });
        let dam = if deleted { DAM_DELETED } else { DAM_NORMAL };

        let mut field = Vec::with_capacity(self.command.xfer.buffer.len() + 20);
        if dd {
            field.extend([0x00; WRITE_SYNC_ZEROS_DD]);
            field.extend([SYNC_BYTE_DD; 3]);
        }
        else {
            field.extend([0x00; WRITE_SYNC_ZEROS_SD]);
        }
        field.push(dam);
        field.extend_from_slice(&self.command.xfer.buffer);
        let seed = crc16_update(if dd { CRC_RESET_A1_A1_A1 } else { CRC_RESET }, dam);
        let crc = crc16(seed, &self.command.xfer.buffer);
        field.extend(crc.to_be_bytes());
        field.push(if dd { FILLER_BYTE_DD } else { FILLER_BYTE_SD });

        let gap2 = if dd { WRITE_GAP2_DD } else { WRITE_GAP2_SD };
        let mut position = idam + (ID_FIELD_BYTES + gap2) * unit;
        let Some(track) = self.selected_track_mut()
        else {
            log::error!("Sector write with no track under the head");
            return;
        };
        let len = track.len();
        for b in field {
            track.write_byte(position % len, dd, b);
            position += unit;
        }
    }

    fn phase_verify(&mut self, at: u64) {
        match self.command.operation {
            Operation::ReadSector { multiple, .. } => {
                self.status.crc_error = self.command.xfer.crc_error;
                self.status.record_type = self.command.xfer.deleted;
                if multiple && !self.status.crc_error {
                    self.sector_register = self.sector_register.wrapping_add(1);
                    self.begin_id_search(at);
                }
                else {
                    self.finish_command("sector read");
                }
            }
            Operation::WriteSector { multiple, .. } => {
                if multiple {
                    self.sector_register = self.sector_register.wrapping_add(1);
                    self.begin_id_search(at);
                }
                else {
                    self.finish_command("sector written");
                }
            }
            Operation::ReadAddress => {
                self.status.crc_error = self.command.xfer.crc_error;
                self.finish_command("address read");
            }
            Operation::ReadTrack => self.finish_command("track read"),
            Operation::WriteTrack => self.finish_command("track written"),
            operation => {
                log::error!("Verify phase entered by {}", operation);
                self.finish_command("invalid phase");
            }
        }
    }

    pub fn log_str(&mut self, s: &str) {
        if self.cmd_log.len() == FDC_LOG_LEN {
            self.cmd_log.pop_front();
        }
        self.cmd_log.push_back(s.to_string());
        log::trace!("{}", s);
    }

    /// Capture the controller state for display.
    pub fn get_status_snapshot(&self, now: u64) -> FdcStatusSnapshot {
        let drive = self.selected_drive();
        let track_data_index = self.position_at(now);
        FdcStatusSnapshot {
            drive_number: self.drive_select,
            op_status: self.state.to_string(),
            command_status: self.command.operation.to_string(),
            busy: self.status.busy,
            drq: self.status.drq,
            status_register: self.status_register(now),
            command_register: self.command_register,
            track_register: self.track_register,
            sector_register: self.sector_register,
            data_register: self.data_register,
            double_density: self.double_density,
            side_one: self.side_one,
            physical_track: drive.physical_track(),
            disk_angle: self.disk_angle(now),
            track_data_index,
            track_data_byte: self.selected_track().map_or(0, |t| t.read_byte(track_data_index, None)),
            index_hole: self.index_hole(now),
            seek_error: self.status.seek_error,
            lost_data: self.status.lost_data,
            crc_error: self.status.crc_error,
            interrupt_pending: self.intrq,
            motor_on: drive.motor_on(),
            disk_present: drive.disk_present(),
            write_protected: drive.is_write_protected(),
            cmd_log: self.cmd_log.iter().cloned().collect(),
        }
    }

    pub fn save_state(&self) -> FdcState {
        let (state, phase) = match self.state {
            ControllerState::Idle => (0, 0),
            ControllerState::Busy(phase) => (1, phase as u8),
            ControllerState::Interrupted => (2, 0),
        };
        let drives: Vec<_> = self.drives.iter().map(FloppyDiskDrive::save_state).collect();
        FdcState {
            version: SNAPSHOT_VERSION,
            command_pulse: self.command_pulse.save_state(),
            motor_off_pulse: self.motor_off_pulse.save_state(),
            command_register: self.command_register,
            track_register: self.track_register,
            sector_register: self.sector_register,
            data_register: self.data_register,
            status_flags: self.status.to_bits(),
            last_type: self.last_type as u8,
            step_in: self.step_in,
            intrq: self.intrq,
            drive_select: self.drive_select as u8,
            side_one: self.side_one,
            double_density: self.double_density,
            wait_enabled: self.wait_enabled,
            state,
            phase,
            operation: self.command.operation.to_state(),
            xfer: self.command.xfer.to_dto(),
            drive_count: drives.len() as u8,
            drives,
        }
    }

    pub fn restore_state(&mut self, state: &FdcState) -> Result<(), Error> {
        let controller_state = match state.state {
            0 => ControllerState::Idle,
            1 => ControllerState::Busy(
                Phase::from_repr(state.phase).ok_or_else(|| anyhow!("Invalid phase: {}", state.phase))?,
            ),
            2 => ControllerState::Interrupted,
            other => return Err(anyhow!("Invalid controller state: {}", other)),
        };
        let operation =
            Operation::from_state(&state.operation).ok_or_else(|| anyhow!("Invalid operation: {}", state.operation.kind))?;
        let last_type = match state.last_type {
            0 => CommandType::TypeI,
            1 => CommandType::TypeII,
            2 => CommandType::TypeIII,
            _ => CommandType::TypeIV,
        };
        if state.drives.len() != self.drives.len() {
            return Err(anyhow!(
                "Snapshot has {} drives, controller has {}",
                state.drives.len(),
                self.drives.len()
            ));
        }
        if state.drive_select as usize >= self.drives.len() {
            return Err(anyhow!("Invalid selected drive: {}", state.drive_select));
        }

        for (drive, drive_state) in self.drives.iter_mut().zip(state.drives.iter()) {
            drive.restore_state(drive_state)?;
        }
        self.command_pulse.restore_state(&state.command_pulse);
        self.motor_off_pulse.restore_state(&state.motor_off_pulse);
        self.command_register = state.command_register;
        self.track_register = state.track_register;
        self.sector_register = state.sector_register;
        self.data_register = state.data_register;
        self.status = StatusFlags::from_bits(state.status_flags);
        self.last_type = last_type;
        self.step_in = state.step_in;
        self.intrq = state.intrq;
        self.drive_select = state.drive_select as usize;
        self.side_one = state.side_one;
        self.double_density = state.double_density;
        self.wait_enabled = state.wait_enabled;
        self.state = controller_state;
        self.command = CommandState {
            operation,
            xfer: TransferState::from_dto(&state.xfer),
        };
        self.log_str("State restored");
        Ok(())
    }

    /// Write the complete controller state: pulses, registers, heads, command
    /// in flight and every mounted track.
    pub fn serialize<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        self.save_state().write(writer)
    }

    pub fn deserialize<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), Error> {
        let state = FdcState::read(reader)?;
        self.restore_state(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_types::fdc::SectorDescriptor,
        floppy::track::DEFAULT_LENGTH_WITH_HEADER,
    };
    use crate::floppy::track::TrackDensity;
    use std::{io::Cursor, path::PathBuf};

    const POLL_US: u64 = 10;
    const DD_DRIVE_0: u8 = 0x81;
    const SD_DRIVE_0: u8 = 0x01;

    fn pattern(track: u8, sector: u8) -> Vec<u8> {
        (0..256u16)
            .map(|i| (i as u8).wrapping_mul(3) ^ track.wrapping_mul(17) ^ sector)
            .collect()
    }

    fn formatted_disk() -> FloppyDisk {
        let mut disk = FloppyDisk::new(false);
        for t in 0..40u8 {
            let sectors: Vec<_> = (1..=10u8)
                .map(|s| SectorDescriptor::new(t, false, s, true, pattern(t, s)))
                .collect();
            let bytes = Track::to_track_bytes(&sectors, None).unwrap();
            disk.insert_track(Track::new(t, false, &bytes, false).unwrap());
        }
        disk
    }

    fn sd_disk() -> FloppyDisk {
        let mut disk = FloppyDisk::new(false);
        for t in 0..40u8 {
            let sectors: Vec<_> = (0..10u8)
                .map(|s| SectorDescriptor::new(t, false, s, false, pattern(t, s)))
                .collect();
            let bytes = Track::to_track_bytes(&sectors, None).unwrap();
            disk.insert_track(Track::new(t, false, &bytes, false).unwrap());
        }
        disk
    }

    /// Track 0 holds a single density boot sector followed by double density sectors.
    fn mixed_disk() -> FloppyDisk {
        let mut disk = formatted_disk();
        let sectors = vec![
            SectorDescriptor::new(0, false, 0, false, pattern(0, 0)),
            SectorDescriptor::new(0, false, 1, true, pattern(0, 1)),
            SectorDescriptor::new(0, false, 2, true, pattern(0, 2)),
        ];
        let bytes = Track::to_track_bytes(&sectors, None).unwrap();
        disk.insert_track(Track::new(0, false, &bytes, false).unwrap());
        disk
    }

    fn blank_disk() -> FloppyDisk {
        let mut disk = FloppyDisk::new(false);
        for t in 0..40u8 {
            disk.insert_track(Track::blank(t, false, DEFAULT_LENGTH_WITH_HEADER));
        }
        disk
    }

    fn format_stream(track: u8, sectors: u8) -> Vec<u8> {
        let mut s = vec![0x4E; 80];
        for n in 1..=sectors {
            s.extend([0x00; 12]);
            s.extend([0xF5; 3]);
            s.extend([0xFE, track, 0, n, 1, 0xF7]);
            s.extend([0x4E; 22]);
            s.extend([0x00; 12]);
            s.extend([0xF5; 3]);
            s.push(0xFB);
            s.extend(std::iter::repeat(n).take(256));
            s.push(0xF7);
            s.extend([0x4E; 54]);
        }
        s
    }

    struct Bench {
        fdc: FloppyController,
        rate: TickRate,
        now: u64,
    }

    impl Bench {
        fn new() -> Self {
            let rate = TickRate::default();
            Self {
                fdc: FloppyController::new(rate, &[]),
                rate,
                now: 0,
            }
        }

        fn with_disk(disk: FloppyDisk, write_protect: bool) -> Self {
            let mut bench = Bench::new();
            bench.fdc.attach_disk(0, disk, write_protect).unwrap();
            bench.out(FDC_DRIVE_SELECT_PORT, DD_DRIVE_0);
            bench
        }

        fn tick(&mut self, us: u64) {
            self.now += self.rate.us_to_ticks(us);
            self.fdc.run(self.now);
        }

        fn out(&mut self, port: u16, data: u8) {
            self.fdc.write_u8(port, data, self.now);
        }

        fn inp(&mut self, port: u16) -> u8 {
            self.fdc.read_u8(port, self.now)
        }

        fn wait_idle(&mut self, limit_us: u64) {
            let mut elapsed = 0;
            while self.fdc.busy() {
                assert!(elapsed < limit_us, "command still busy after {} us", elapsed);
                self.tick(100);
                elapsed += 100;
            }
        }

        fn read_data(&mut self, limit_us: u64) -> Vec<u8> {
            let mut data = Vec::new();
            let mut elapsed = 0;
            while self.fdc.busy() {
                assert!(elapsed < limit_us, "read still busy after {} us", elapsed);
                self.tick(POLL_US);
                elapsed += POLL_US;
                if self.fdc.drq() {
                    data.push(self.inp(FDC_DATA_PORT));
                }
            }
            data
        }

        fn write_data(&mut self, data: &[u8], fill: u8, limit_us: u64) {
            let mut bytes = data.iter().copied();
            let mut elapsed = 0;
            while self.fdc.busy() {
                assert!(elapsed < limit_us, "write still busy after {} us", elapsed);
                self.tick(POLL_US);
                elapsed += POLL_US;
                if self.fdc.drq() {
                    let byte = bytes.next().unwrap_or(fill);
                    self.out(FDC_DATA_PORT, byte);
                }
            }
        }

        fn seek(&mut self, track: u8) {
            self.out(FDC_DATA_PORT, track);
            self.out(FDC_COMMAND_STATUS_PORT, 0x10);
            self.wait_idle(1_000_000);
            assert_eq!(self.fdc.track_register(), track);
        }
    }

    #[test]
    fn test_seek_then_read_unformatted_track() {
        let mut bench = Bench::with_disk(blank_disk(), false);
        bench.seek(5);
        assert_eq!(bench.fdc.drive(0).unwrap().physical_track(), 5);
        assert!(bench.fdc.intrq());
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_SEEK_ERROR, 0);

        bench.out(FDC_SECTOR_PORT, 3);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.wait_idle(2_000_000);

        let status = bench.inp(FDC_COMMAND_STATUS_PORT);
        assert_eq!(status & STATUS_BUSY, 0);
        assert_ne!(status & STATUS_RECORD_NOT_FOUND, 0);
        assert_eq!(bench.fdc.state(), ControllerState::Idle);
    }

    #[test]
    fn test_read_sector() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.seek(2);
        bench.out(FDC_SECTOR_PORT, 3);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.fdc.state(), ControllerState::Busy(Phase::Settling));

        let data = bench.read_data(1_000_000);
        assert_eq!(data, pattern(2, 3));
        let status = bench.inp(FDC_COMMAND_STATUS_PORT);
        let errors = STATUS_BUSY | STATUS_LOST_DATA | STATUS_CRC_ERROR | STATUS_RECORD_NOT_FOUND | STATUS_RECORD_TYPE;
        assert_eq!(status & errors, 0);
    }

    #[test]
    fn test_read_multiple_ends_with_record_not_found() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 9);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x90);

        let data = bench.read_data(2_000_000);
        assert_eq!(data.len(), 512);
        assert_eq!(&data[..256], &pattern(0, 9)[..]);
        assert_eq!(&data[256..], &pattern(0, 10)[..]);
        assert_eq!(bench.fdc.sector_register(), 11);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_RECORD_NOT_FOUND, 0);
    }

    #[test]
    fn test_unserviced_read_loses_data() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.wait_idle(1_000_000);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_LOST_DATA, 0);
    }

    #[test]
    fn test_write_then_read_sector() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.seek(7);
        let payload: Vec<u8> = (0..256u16).map(|i| (255 - i) as u8).collect();

        bench.out(FDC_SECTOR_PORT, 4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xA0);
        bench.write_data(&payload, 0, 1_000_000);
        let status = bench.inp(FDC_COMMAND_STATUS_PORT);
        assert_eq!(status & (STATUS_LOST_DATA | STATUS_RECORD_NOT_FOUND | STATUS_WRITE_PROTECT), 0);

        let track = bench.fdc.drive_mut(0).unwrap().track_mut(false).unwrap();
        assert!(track.changed());
        let sectors = track.to_sector_descriptors();
        assert_eq!(sectors.len(), 10);
        let written = sectors.iter().find(|s| s.sector_number == 4).unwrap();
        assert_eq!(written.sector_data, payload);
        assert!(!written.crc_error);
        let neighbour = sectors.iter().find(|s| s.sector_number == 5).unwrap();
        assert_eq!(neighbour.sector_data, pattern(7, 5));
        assert!(!neighbour.crc_error);

        bench.out(FDC_SECTOR_PORT, 4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), payload);
    }

    #[test]
    fn test_deleted_mark_sets_record_type() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xA1);
        bench.write_data(&[0x11; 256], 0, 1_000_000);

        bench.out(FDC_SECTOR_PORT, 2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), vec![0x11; 256]);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_RECORD_TYPE, 0);
    }

    #[test]
    fn test_write_without_data_is_lost() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xA0);
        bench.wait_idle(1_000_000);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_LOST_DATA, 0);

        let track = bench.fdc.drive_mut(0).unwrap().track_mut(false).unwrap();
        assert!(!track.changed());
    }

    #[test]
    fn test_write_protected_disk() {
        let mut bench = Bench::with_disk(formatted_disk(), true);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xA0);
        assert!(!bench.fdc.busy());
        assert!(bench.fdc.intrq());
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_WRITE_PROTECT, 0);

        bench.out(FDC_COMMAND_STATUS_PORT, 0xF4);
        assert!(!bench.fdc.busy());
    }

    #[test]
    fn test_no_disk_not_ready() {
        let mut bench = Bench::new();
        bench.out(FDC_DRIVE_SELECT_PORT, DD_DRIVE_0);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert!(!bench.fdc.busy());
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_NOT_READY, 0);

        // Head movement still works, but verification cannot find an ID field.
        bench.out(FDC_DATA_PORT, 3);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x10);
        bench.wait_idle(1_000_000);
        assert_eq!(bench.fdc.drive(0).unwrap().physical_track(), 3);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_SEEK_ERROR, 0);

        bench.out(FDC_COMMAND_STATUS_PORT, 0x04);
        bench.wait_idle(2_000_000);
        let status = bench.inp(FDC_COMMAND_STATUS_PORT);
        assert_ne!(status & STATUS_SEEK_ERROR, 0);
        assert_ne!(status & STATUS_TRACK_ZERO, 0);
    }

    #[test]
    fn test_restore_with_verify() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.seek(10);
        assert_eq!(bench.fdc.drive(0).unwrap().physical_track(), 10);

        bench.out(FDC_COMMAND_STATUS_PORT, 0x0C);
        bench.wait_idle(1_000_000);
        assert_eq!(bench.fdc.track_register(), 0);
        assert!(bench.fdc.drive(0).unwrap().track_zero());
        let status = bench.inp(FDC_COMMAND_STATUS_PORT);
        assert_eq!(status & (STATUS_SEEK_ERROR | STATUS_CRC_ERROR), 0);
        assert_ne!(status & STATUS_TRACK_ZERO, 0);
        assert_ne!(status & STATUS_HEAD_LOADED, 0);
    }

    #[test]
    fn test_step_commands() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        let physical = |bench: &Bench| bench.fdc.drive(0).unwrap().physical_track();

        bench.out(FDC_COMMAND_STATUS_PORT, 0x50);
        bench.wait_idle(100_000);
        assert_eq!((bench.fdc.track_register(), physical(&bench)), (1, 1));

        bench.out(FDC_COMMAND_STATUS_PORT, 0x70);
        bench.wait_idle(100_000);
        assert_eq!((bench.fdc.track_register(), physical(&bench)), (0, 0));

        bench.out(FDC_COMMAND_STATUS_PORT, 0x40);
        bench.wait_idle(100_000);
        assert_eq!((bench.fdc.track_register(), physical(&bench)), (0, 1));

        // Plain step repeats the last direction.
        bench.out(FDC_COMMAND_STATUS_PORT, 0x20);
        bench.wait_idle(100_000);
        assert_eq!((bench.fdc.track_register(), physical(&bench)), (0, 2));
    }

    #[test]
    fn test_read_address() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.seek(2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xC0);
        let id = bench.read_data(1_000_000);

        assert_eq!(id.len(), 6);
        assert_eq!(id[0], 2);
        assert_eq!(id[1], 0);
        assert!((1..=10).contains(&id[2]));
        assert_eq!(id[3], 1);
        assert_eq!(crc16(CRC_RESET_A1_A1_A1_FE, &id[..4]), u16::from_be_bytes([id[4], id[5]]));
        assert_eq!(bench.fdc.sector_register(), 2);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);
    }

    #[test]
    fn test_read_track_covers_revolution() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        let expected = bench.fdc.drive(0).unwrap().track(false).unwrap().data().to_vec();
        bench.out(FDC_COMMAND_STATUS_PORT, 0xE0);
        let data = bench.read_data(1_000_000);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_write_track_formats() {
        let mut bench = Bench::with_disk(blank_disk(), false);
        bench.seek(4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xF4);
        bench.write_data(&format_stream(4, 5), 0x4E, 1_000_000);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_LOST_DATA, 0);

        let track = bench.fdc.drive_mut(0).unwrap().track_mut(false).unwrap();
        let sectors = track.to_sector_descriptors();
        assert_eq!(sectors.len(), 5);
        for (n, sector) in (1..=5u8).zip(sectors.iter()) {
            assert_eq!(sector.track_number, 4);
            assert_eq!(sector.sector_number, n);
            assert_eq!(sector.sector_data, vec![n; 256]);
            assert!(!sector.crc_error);
        }

        bench.out(FDC_SECTOR_PORT, 3);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), vec![3; 256]);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);
    }

    fn sd_format_stream(track: u8, sectors: u8) -> Vec<u8> {
        let mut s = vec![0xFF; 16];
        for n in 1..=sectors {
            s.extend([0x00; 6]);
            s.extend([0xFE, track, 0, n, 1, 0xF7]);
            s.extend([0xFF; 11]);
            s.extend([0x00; 6]);
            s.push(0xFB);
            s.extend(std::iter::repeat(n).take(256));
            s.push(0xF7);
            s.extend([0xFF; 17]);
        }
        s
    }

    #[test]
    fn test_sd_seek_verify_and_read() {
        let mut bench = Bench::with_disk(sd_disk(), false);
        bench.out(FDC_DRIVE_SELECT_PORT, SD_DRIVE_0);
        bench.out(FDC_DATA_PORT, 6);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x14);
        bench.wait_idle(2_000_000);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_SEEK_ERROR, 0);
        assert_eq!(bench.fdc.track_register(), 6);

        bench.out(FDC_SECTOR_PORT, 9);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), pattern(6, 9));
        let errors = STATUS_LOST_DATA | STATUS_CRC_ERROR | STATUS_RECORD_NOT_FOUND;
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & errors, 0);

        // The same disk has no IDAMs a double density read can find.
        bench.out(FDC_DRIVE_SELECT_PORT, DD_DRIVE_0);
        bench.out(FDC_SECTOR_PORT, 9);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.wait_idle(2_000_000);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_RECORD_NOT_FOUND, 0);
    }

    #[test]
    fn test_sd_write_then_read_sector() {
        let mut bench = Bench::with_disk(sd_disk(), false);
        bench.out(FDC_DRIVE_SELECT_PORT, SD_DRIVE_0);
        bench.seek(3);
        let payload: Vec<u8> = (0..256u16).map(|i| (i as u8) ^ 0x5A).collect();

        bench.out(FDC_SECTOR_PORT, 4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xA0);
        bench.write_data(&payload, 0, 1_000_000);
        assert_eq!(
            bench.inp(FDC_COMMAND_STATUS_PORT) & (STATUS_LOST_DATA | STATUS_RECORD_NOT_FOUND),
            0
        );

        let track = bench.fdc.drive_mut(0).unwrap().track_mut(false).unwrap();
        assert_eq!(track.density(), &TrackDensity::Uniform(false));
        let sectors = track.to_sector_descriptors();
        assert_eq!(sectors.len(), 10);
        let written = sectors.iter().find(|s| s.sector_number == 4).unwrap();
        assert_eq!(written.sector_data, payload);
        assert!(!written.double_density);
        assert!(!written.crc_error);
        let neighbour = sectors.iter().find(|s| s.sector_number == 5).unwrap();
        assert_eq!(neighbour.sector_data, pattern(3, 5));

        bench.out(FDC_SECTOR_PORT, 4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), payload);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);
    }

    #[test]
    fn test_sd_read_address_and_track() {
        let mut bench = Bench::with_disk(sd_disk(), false);
        bench.out(FDC_DRIVE_SELECT_PORT, SD_DRIVE_0);
        bench.seek(2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xC0);
        let id = bench.read_data(1_000_000);
        assert_eq!(id.len(), 6);
        assert_eq!(id[0], 2);
        assert!(id[2] < 10);
        assert_eq!(crc16(CRC_RESET_FE, &id[..4]), u16::from_be_bytes([id[4], id[5]]));
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);

        // Single density bytes are stored doubled; a track read returns each once.
        let expected: Vec<u8> = bench
            .fdc
            .drive(0)
            .unwrap()
            .track(false)
            .unwrap()
            .data()
            .iter()
            .step_by(2)
            .copied()
            .collect();
        bench.out(FDC_COMMAND_STATUS_PORT, 0xE0);
        assert_eq!(bench.read_data(2_000_000), expected);
    }

    #[test]
    fn test_sd_write_track_formats() {
        let mut bench = Bench::with_disk(blank_disk(), false);
        bench.out(FDC_DRIVE_SELECT_PORT, SD_DRIVE_0);
        bench.seek(4);
        bench.out(FDC_COMMAND_STATUS_PORT, 0xF4);
        bench.write_data(&sd_format_stream(4, 5), 0xFF, 2_000_000);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_LOST_DATA, 0);

        let track = bench.fdc.drive_mut(0).unwrap().track_mut(false).unwrap();
        let sectors = track.to_sector_descriptors();
        assert_eq!(sectors.len(), 5);
        for (n, sector) in (1..=5u8).zip(sectors.iter()) {
            assert_eq!(sector.track_number, 4);
            assert_eq!(sector.sector_number, n);
            assert!(!sector.double_density);
            assert_eq!(sector.sector_data, vec![n; 256]);
            assert!(!sector.crc_error);
        }

        bench.out(FDC_SECTOR_PORT, 2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), vec![2; 256]);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);
    }

    #[test]
    fn test_mixed_density_track_reads() {
        let mut bench = Bench::with_disk(mixed_disk(), false);
        assert!(matches!(
            bench.fdc.drive(0).unwrap().track(false).unwrap().density(),
            TrackDensity::Mixed(_)
        ));

        bench.out(FDC_DRIVE_SELECT_PORT, SD_DRIVE_0);
        bench.out(FDC_SECTOR_PORT, 0);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        assert_eq!(bench.read_data(1_000_000), pattern(0, 0));
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_CRC_ERROR, 0);

        // The double density sectors are invisible in single density.
        bench.out(FDC_SECTOR_PORT, 2);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.wait_idle(2_000_000);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_RECORD_NOT_FOUND, 0);

        bench.out(FDC_DRIVE_SELECT_PORT, DD_DRIVE_0);
        for sector in 1..=2u8 {
            bench.out(FDC_SECTOR_PORT, sector);
            bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
            assert_eq!(bench.read_data(1_000_000), pattern(0, sector));
            let errors = STATUS_CRC_ERROR | STATUS_RECORD_NOT_FOUND;
            assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & errors, 0);
        }

        bench.out(FDC_SECTOR_PORT, 0);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.wait_idle(2_000_000);
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_RECORD_NOT_FOUND, 0);
    }

    #[test]
    fn test_force_interrupt() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 5);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.tick(5_000);
        assert!(bench.fdc.busy());

        bench.out(FDC_COMMAND_STATUS_PORT, 0xD0);
        assert!(!bench.fdc.busy());
        assert_eq!(bench.fdc.state(), ControllerState::Idle);
        assert!(!bench.fdc.intrq());
        bench.tick(300_000);
        assert!(!bench.fdc.drq());

        bench.out(FDC_COMMAND_STATUS_PORT, 0xD8);
        assert_eq!(bench.fdc.state(), ControllerState::Interrupted);
        bench.inp(FDC_COMMAND_STATUS_PORT);
        assert!(bench.fdc.intrq());

        bench.out(FDC_COMMAND_STATUS_PORT, 0xD0);
        assert_eq!(bench.fdc.state(), ControllerState::Idle);
        assert!(!bench.fdc.intrq());
    }

    #[test]
    fn test_command_ignored_while_busy() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x00);
        assert!(matches!(bench.fdc.operation(), Operation::ReadSector { .. }));
    }

    #[test]
    fn test_disk_change_abandons_command() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        bench.tick(1_000);
        assert!(bench.fdc.unload_image(0).is_some());
        assert!(!bench.fdc.busy());
        assert_eq!(bench.fdc.state(), ControllerState::Idle);
        assert_eq!(bench.fdc.operation(), Operation::NoOperation);
    }

    #[test]
    fn test_index_pulse_and_motor_timeout() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        assert!(bench.fdc.drive(0).unwrap().motor_on());
        assert_ne!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_INDEX, 0);
        bench.tick(10_000);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_INDEX, 0);

        for _ in 0..21 {
            bench.tick(100_000);
        }
        assert!(!bench.fdc.drive(0).unwrap().motor_on());
        // Start of a revolution, but a stopped disk gives no index pulses.
        bench.now = bench.rate.us_to_ticks(2_400_000);
        assert_eq!(bench.inp(FDC_COMMAND_STATUS_PORT) & STATUS_INDEX, 0);
    }

    #[test]
    fn test_status_snapshot() {
        let mut bench = Bench::with_disk(formatted_disk(), false);
        bench.out(FDC_SECTOR_PORT, 1);
        bench.out(FDC_COMMAND_STATUS_PORT, 0x80);
        let snapshot = bench.fdc.get_status_snapshot(bench.now);
        assert!(snapshot.busy);
        assert!(snapshot.double_density);
        assert_eq!(snapshot.command_status, "Read Sector");
        assert_eq!(snapshot.op_status, "Busy: Settling");
        assert!(snapshot.cmd_log.iter().any(|l| l.starts_with("Read Sector (80)")));
        assert!(snapshot.to_string().contains("Read Sector"));
    }

    #[test]
    fn test_snapshot_resumes_command() {
        let mut running = Bench::with_disk(formatted_disk(), false);
        running.seek(1);
        running.out(FDC_SECTOR_PORT, 4);
        running.out(FDC_COMMAND_STATUS_PORT, 0x80);
        running.tick(3_000);
        assert!(running.fdc.busy());

        let mut buf = Cursor::new(Vec::new());
        running.fdc.serialize(&mut buf).unwrap();
        buf.set_position(0);

        let mut restored = Bench::new();
        restored.fdc.deserialize(&mut buf).unwrap();
        restored.now = running.now;
        assert_eq!(restored.fdc.state(), running.fdc.state());
        assert_eq!(restored.fdc.operation(), running.fdc.operation());

        let expected = running.read_data(1_000_000);
        let resumed = restored.read_data(1_000_000);
        assert_eq!(expected, pattern(1, 4));
        assert_eq!(resumed, expected);
        assert_eq!(
            restored.inp(FDC_COMMAND_STATUS_PORT),
            running.inp(FDC_COMMAND_STATUS_PORT)
        );
    }

    #[test]
    fn test_snapshot_keeps_image_path() {
        let mut disk = formatted_disk();
        disk.set_file_path(Some(PathBuf::from("disks/ldos531.dmk")));
        let mut running = Bench::with_disk(disk, false);
        running.out(FDC_SECTOR_PORT, 1);
        running.out(FDC_COMMAND_STATUS_PORT, 0xA0);
        running.write_data(&[0x77; 256], 0, 1_000_000);

        let mut buf = Cursor::new(Vec::new());
        running.fdc.serialize(&mut buf).unwrap();
        buf.set_position(0);

        let mut restored = Bench::new();
        restored.fdc.deserialize(&mut buf).unwrap();
        let disk = restored.fdc.drive(0).and_then(|d| d.disk()).unwrap();
        assert_eq!(disk.file_path(), Some(Path::new("disks/ldos531.dmk")));
        assert!(disk.changed());
    }

    #[test]
    fn test_snapshot_rejects_garbage() {
        let mut bench = Bench::new();
        let mut buf = Cursor::new(vec![0u8; 64]);
        assert!(bench.fdc.deserialize(&mut buf).is_err());
    }
}
