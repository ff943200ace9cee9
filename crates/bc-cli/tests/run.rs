use assert_cmd::Command;

fn get_cmd() -> Command {
    Command::cargo_bin("bc-cli").expect("could not create bc-cli command")
}

fn contains_slice<T: Eq>(slice: &[T], other: &[T]) -> bool {
    if other.is_empty() {
        return true;
    }
    slice.windows(other.len()).any(|window| window == other)
}

#[test]
fn fib_ten_with_two_registers_returns_fifty_five() {
    let assert = get_cmd().args(["fib", "--registers", "2"]).assert().success();
    let stdout = &assert.get_output().stdout;
    assert!(contains_slice(stdout, b"result = 55"));
}

#[test]
fn fib_with_one_register_fails() {
    get_cmd().args(["fib", "--registers", "1"]).assert().failure();
}

#[test]
fn rlsra_allocator_also_returns_fifty_five() {
    let assert = get_cmd()
        .args(["fib", "--allocator", "rlsra", "--registers", "3"])
        .assert()
        .success();
    let stdout = &assert.get_output().stdout;
    assert!(contains_slice(stdout, b"result = 55"));
}

#[test]
fn straight_line_sum_returns_zero() {
    let assert = get_cmd().args(["sum", "--registers", "2"]).assert().success();
    let stdout = &assert.get_output().stdout;
    assert!(contains_slice(stdout, b"result = 0"));
}

#[test]
fn branch_taken_returns_one() {
    let assert = get_cmd().args(["branch", "--registers", "2"]).assert().success();
    let stdout = &assert.get_output().stdout;
    assert!(contains_slice(stdout, b"result = 1"));
}

#[test]
fn dump_flag_prints_the_annotated_ir() {
    let assert = get_cmd().args(["fib", "--registers", "2", "--dump"]).assert().success();
    let stdout = &assert.get_output().stdout;
    assert!(contains_slice(stdout, b"blk0"));
}
