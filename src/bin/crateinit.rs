use clap::Parser;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// crateinit — the in-namespace init the daemon fexecve's for meta
/// containers and re-homed tasks. Reaps orphans; when the awaited pid
/// dies, exits with its status.
#[derive(Parser, Debug)]
#[command(name = "crateinit", version, about)]
struct Args {
    /// Name of the owning container, for ps output.
    #[arg(long)]
    container: String,

    /// Pid whose exit status this init mirrors.
    #[arg(long)]
    wait: Option<i32>,
}

fn status_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn main() {
    let args = Args::parse();
    let wait_for = args.wait.map(Pid::from_raw);

    if let Ok(name) = std::ffi::CString::new(format!("init:{}", args.container)) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr());
        }
    }

    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                if let (Some(target), Some(pid)) = (wait_for, status.pid()) {
                    if pid == target {
                        std::process::exit(status_code(status));
                    }
                }
            }
            Err(Errno::ECHILD) => {
                if wait_for.is_some() {
                    // the awaited task is gone without us seeing it die
                    std::process::exit(0);
                }
                // nothing to reap yet; as pid 1 we just wait for orphans
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            Err(Errno::EINTR) => continue,
            Err(_) => std::process::exit(1),
        }
    }
}
