use parcelnet_conn::JsonCodec;
use parcelnet_frame::codec::{HEADER_SIZE, MAGIC, MAX_PARCEL_SIZE, MIN_PARCEL_SIZE};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("parcelnet {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: parcelnet");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("parcel_magic: {}", String::from_utf8_lossy(&MAGIC));
    println!("parcel_header: {HEADER_SIZE} bytes");
    println!("parcel_size: {MIN_PARCEL_SIZE}..={MAX_PARCEL_SIZE}");
    println!("codec: json (method {})", JsonCodec::METHOD_ID);

    Ok(SUCCESS)
}
