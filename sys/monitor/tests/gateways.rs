// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register gateways, supervisor calls and box table checks.

mod common;

use std::collections::HashMap;

use boxlib::svc::{CustomSvc, FastSvc, Svc, HALT_KIND_USER, HALT_KIND_VIOLATION};
use boxlib::{
    BoxConfig, BoxId, FaultInfo, RegisterGateway, RegisterOp, RegisterWidth,
    UsageError, Violation, BOX_MAGIC, NOT_SUPPORTED,
};
use common::{contexts, pools, CLIENT, CLIENT_CFG, CONFIGS, SERVER, SERVER_CFG};
use monitor::regs::RegisterBus;
use monitor::{ConfigError, Monitor};

#[derive(Default)]
struct FakeBus {
    regs: HashMap<u32, u32>,
    writes: Vec<(u32, RegisterWidth, u32)>,
}

impl RegisterBus for FakeBus {
    fn read(&mut self, address: u32, _width: RegisterWidth) -> u32 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    fn write(&mut self, address: u32, width: RegisterWidth, value: u32) {
        self.regs.insert(address, value);
        self.writes.push((address, width, value));
    }
}

const GPIO: u32 = 0x4002_0014;

static SET_LED: RegisterGateway = RegisterGateway::new(
    &CLIENT_CFG,
    GPIO,
    0x0000_00F0,
    RegisterOp::SetBits,
    RegisterWidth::Word,
);
static READ_LOW: RegisterGateway = RegisterGateway::new(
    &CLIENT_CFG,
    GPIO,
    0xFFFF_FFFF,
    RegisterOp::Read,
    RegisterWidth::Half,
);
static TOGGLE_BYTE: RegisterGateway = RegisterGateway::new(
    &CLIENT_CFG,
    GPIO + 1,
    0x0F,
    RegisterOp::ToggleBits,
    RegisterWidth::Byte,
);
static SERVERS_GATEWAY: RegisterGateway = RegisterGateway::new(
    &SERVER_CFG,
    GPIO,
    !0,
    RegisterOp::Write,
    RegisterWidth::Word,
);
static CROOKED: RegisterGateway = RegisterGateway::new(
    &CLIENT_CFG,
    GPIO + 2,
    !0,
    RegisterOp::Write,
    RegisterWidth::Word,
);
static BAD_BRANCH: RegisterGateway = RegisterGateway {
    branch: 0,
    ..RegisterGateway::new(
        &CLIENT_CFG,
        GPIO,
        !0,
        RegisterOp::Read,
        RegisterWidth::Word,
    )
};

fn client() -> BoxId {
    BoxId(CLIENT as u16)
}

#[test]
fn register_operations() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
    let mut bus = FakeBus::default();
    bus.regs.insert(GPIO, 0x1234_5601);
    bus.regs.insert(GPIO + 1, 0xA5);

    // Only bits in the gateway's mask get set.
    assert_eq!(
        monitor.register_gateway(client(), &SET_LED, 0xFFFF_FFFF, &mut bus),
        Ok(0x1234_56F1)
    );
    assert_eq!(bus.regs[&GPIO], 0x1234_56F1);

    // Reads are limited to the access width and don't write.
    let writes = bus.writes.len();
    assert_eq!(
        monitor.register_gateway(client(), &READ_LOW, 0, &mut bus),
        Ok(0x56F1)
    );
    assert_eq!(bus.writes.len(), writes);

    assert_eq!(
        monitor.register_gateway(client(), &TOGGLE_BYTE, 0xFF, &mut bus),
        Ok(0xAA)
    );
    assert_eq!(
        bus.writes.last(),
        Some(&(GPIO + 1, RegisterWidth::Byte, 0xAA))
    );
    assert_eq!(monitor.fault_of(client()), None);
}

#[test]
fn foreign_register_gateway_faults_caller() {
    for gw in [&SERVERS_GATEWAY, &CROOKED, &BAD_BRANCH] {
        let pools = pools();
        let boxes = contexts(&pools);
        let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
        let mut bus = FakeBus::default();

        let bad = Err(FaultInfo::Violation(Violation::BadGateway));
        assert_eq!(monitor.register_gateway(client(), gw, 1, &mut bus), bad);
        assert_eq!(monitor.fault_of(client()), bad.err());
        assert!(bus.writes.is_empty());
        // And the box stays faulted.
        assert_eq!(
            monitor.register_gateway(client(), &SET_LED, 1, &mut bus),
            bad
        );
    }
}

#[test]
fn svc_entries_owned_here() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();

    let box_id_self = CustomSvc::BoxIdSelf.imm();
    let ns_len = CustomSvc::BoxNamespaceLen.imm();
    assert_eq!(monitor.svc(client(), box_id_self, [0; 4]), Ok(1));
    assert_eq!(
        monitor.svc(BoxId(SERVER as u16), box_id_self, [0; 4]),
        Ok(SERVER as u32)
    );
    assert_eq!(
        monitor.svc(client(), ns_len, [SERVER as u32, 0, 0, 0]),
        Ok("server".len() as u32)
    );
    assert_eq!(monitor.svc(client(), ns_len, [0; 4]), Ok(0));

    // Entries owned elsewhere are refused without harm.
    assert_eq!(
        monitor.svc(client(), FastSvc::IrqEnable.imm(), [3, 0, 0, 0]),
        Ok(NOT_SUPPORTED)
    );
    assert_eq!(
        monitor.svc(client(), CustomSvc::BenchmarkStart.imm(), [0; 4]),
        Ok(NOT_SUPPORTED)
    );
    assert_eq!(monitor.fault_of(client()), None);
}

#[test]
fn svc_misuse_faults_caller() {
    let cases = [
        (
            CustomSvc::BoxNamespaceLen.imm(),
            [9, 0, 0, 0],
            FaultInfo::SyscallUsage(UsageError::BoxOutOfRange),
        ),
        (
            Svc::Custom { index: 0x7F }.encode(),
            [0; 4],
            FaultInfo::SyscallUsage(UsageError::BadSvcNumber),
        ),
        (
            Svc::Fast { index: 15, nargs: 0 }.encode(),
            [0; 4],
            FaultInfo::SyscallUsage(UsageError::BadSvcNumber),
        ),
        (
            // Right entry, wrong argument count.
            Svc::Fast {
                index: FastSvc::IrqEnable as u8,
                nargs: 3,
            }
            .encode(),
            [0; 4],
            FaultInfo::SyscallUsage(UsageError::BadSvcNumber),
        ),
        (
            CustomSvc::HaltUserError.imm(),
            [0xDEAD, HALT_KIND_USER, 0, 0],
            FaultInfo::UserHalt(0xDEAD),
        ),
        (
            CustomSvc::HaltUserError.imm(),
            [Violation::DoubleWait as u32, HALT_KIND_VIOLATION, 0, 0],
            FaultInfo::Violation(Violation::DoubleWait),
        ),
    ];
    for (imm, args, fault) in cases {
        let pools = pools();
        let boxes = contexts(&pools);
        let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();

        assert_eq!(monitor.svc(client(), imm, args), Err(fault));
        assert_eq!(monitor.fault_of(client()), Some(fault));
        assert_eq!(monitor.fault_of(BoxId(SERVER as u16)), None);
        assert_eq!(monitor.stats().faults, 1);
    }
}

#[test]
fn monitor_rejects_bad_table() {
    static BAD_MAGIC: BoxConfig = BoxConfig {
        magic: !BOX_MAGIC,
        ..BoxConfig::new(Some("bad"), 1024, boxlib::bss_sizes(0, 0), &[])
    };
    static LONG_NAME: BoxConfig = BoxConfig::new(
        Some("a-namespace-well-past-thirty-seven-bytes"),
        1024,
        boxlib::bss_sizes(0, 0),
        &[],
    );
    let pools = pools();
    let boxes = contexts(&pools);

    let table = [CONFIGS[0], &BAD_MAGIC, CONFIGS[2]];
    assert_eq!(
        Monitor::new(&table, &boxes).err(),
        Some(ConfigError::BadMagic(1))
    );
    let table = [CONFIGS[0], CONFIGS[1], &LONG_NAME];
    assert_eq!(
        Monitor::new(&table, &boxes).err(),
        Some(ConfigError::BadNamespace(2))
    );
    let table = [CONFIGS[0], CONFIGS[1], CONFIGS[1]];
    assert_eq!(
        Monitor::new(&table, &boxes).err(),
        Some(ConfigError::DuplicateNamespace(2))
    );
    assert!(Monitor::new(&CONFIGS, &boxes).is_ok());
}
