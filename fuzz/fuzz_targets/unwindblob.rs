#![no_main]

use libfuzzer_sys::fuzz_target;
use nativescope::{
    arch::{Amd64, Architecture, Arm64},
    codeman::{CodeManagerFlags, GcInfoDecoder, GcSlot, UnwindFlags},
    CodeManager, MemoryRegion, ModuleRegistration, RegDisplay, RegistrationConfig,
};

const BASE: u64 = 0x1_4000_0000;
const STACK: u64 = 0x7ff0_0000;

struct NoGcInfo;

impl GcInfoDecoder for NoGcInfo {
    fn is_interruptible(&self, _: &[u8], _: u32) -> bool {
        false
    }

    fn is_safe_point(&self, _: &[u8], _: u32) -> bool {
        false
    }

    fn enumerate_live_slots(
        &self,
        _: &[u8],
        _: u32,
        _: CodeManagerFlags,
        _: bool,
        _: &mut dyn FnMut(GcSlot),
    ) -> bool {
        true
    }

    fn reverse_pinvoke_frame_slot(&self, _: &[u8]) -> Option<i32> {
        Some(0)
    }

    fn stack_base_register(&self, _: &[u8]) -> Option<u32> {
        None
    }

    fn has_tail_calls(&self, _: &[u8]) -> bool {
        false
    }
}

/// Treat the input as the mapped image: code at 0x1000, a one-entry function table at
/// 0x1000 pointing at unwind data taken from the input itself.
fn unwind_one<A: Architecture>(data: &[u8]) {
    if data.len() < 0x1100 {
        return;
    }

    let Ok(image) = ModuleRegistration::new(BASE, data)
        .managed_code(BASE + 0x1000, 0x100)
        .function_table(0x1000, 1)
        .build()
    else {
        return;
    };
    let Ok(manager) =
        CodeManager::<A, _>::with_config(image, NoGcInfo, RegistrationConfig::strict())
    else {
        return;
    };

    let stack = [0x5A_u8; 0x400];
    let memory = MemoryRegion::new(STACK, &stack);
    let pc = BASE + 0x1000 + u64::from(data[0x10F]);

    if let Ok(Some(method)) = manager.find_method_info(pc) {
        let mut regs = RegDisplay::<A>::new(pc, STACK + 0x100);
        let _ = manager.unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &memory);
        let _ = manager.return_address_hijack_info(&method, &regs, &memory);
        let _ = manager.eh_enum_init(&method).map(|clauses| clauses.map(Iterator::count));
    }
}

fuzz_target!(|data: &[u8]| {
    unwind_one::<Amd64>(data);
    unwind_one::<Arm64>(data);
});
