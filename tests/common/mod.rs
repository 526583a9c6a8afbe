use assert_cmd::Command;

pub fn codewright_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("codewright").expect("codewright test binary should build")
    }
}
