/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use lcra::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use lcra::fuzzing::func::{Func, Options};
use lcra::fuzzing::fuzz_target;
use lcra::RegallocOptions;

#[derive(Clone, Debug)]
struct TestCase {
    func: Func,
    stress_spilling: bool,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<TestCase> {
        Ok(TestCase {
            func: Func::arbitrary_with_options(
                u,
                &Options {
                    max_blocks: 48,
                    max_insts_per_block: 32,
                    ..Options::default()
                },
            )?,
            stress_spilling: bool::arbitrary(u)?,
        })
    }
}

fuzz_target!(|testcase: TestCase| {
    let mut func = testcase.func;
    let _ = env_logger::try_init();
    log::trace!("func:\n{}", func);
    let env = lcra::fuzzing::func::machine_env();

    let options = RegallocOptions {
        stress_spilling: testcase.stress_spilling,
        check: true,
        ..RegallocOptions::default()
    };
    lcra::run(&mut func, &env, &options).expect("regalloc did not succeed");
    assert!(!func.has_virtual_operands());
});
