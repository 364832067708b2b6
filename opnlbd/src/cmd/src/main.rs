mod cmd;

fn main() {
    cmd::run();
}
