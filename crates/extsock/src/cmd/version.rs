use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("extsock {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: extsock");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("EXTSOCK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("default_socket: {}", extsock_bridge::DEFAULT_SOCKET_PATH);
    println!(
        "protocol: {} opcodes, max frame {} bytes",
        extsock_frame::Opcode::ALL.len(),
        extsock_frame::MAX_FRAME_SIZE
    );
    println!("features: bridge={}, cli=true", cfg!(feature = "bridge"));

    Ok(SUCCESS)
}
