pub mod commands;

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("rtu_master")
        .version(crate::VERSION)
        .about("Polls holding registers from a Modbus RTU slave")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .global(true)
                .help("Serial port, e.g. /dev/ttyUSB0 or COM3"),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("RATE")
                .global(true)
                .value_parser(value_parser!(u32))
                .help("Baud rate"),
        )
        .arg(
            Arg::new("slave")
                .short('s')
                .long("slave")
                .value_name("ADDRESS")
                .global(true)
                .value_parser(value_parser!(u8))
                .help("Slave address (1-247)"),
        )
        .arg(
            Arg::new("registers")
                .short('r')
                .long("registers")
                .value_name("LIST")
                .global(true)
                .help("Comma separated register addresses, polled in this order"),
        )
        .arg(
            Arg::new("signed")
                .long("signed")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Decode --registers values as signed 16-bit"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("MS")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Response timeout in milliseconds"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("MS")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Pause between poll cycles in milliseconds"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .global(true)
                .value_parser(["console", "json"])
                .default_value("console")
                .help("Result output format"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging, including every bus event"),
        )
        .subcommand(Command::new("poll").about("Poll continuously until Ctrl+C (default)"))
        .subcommand(Command::new("once").about("Run a single poll cycle and print the transaction log"))
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("crc")
                .about("Compute the Modbus CRC of hex bytes")
                .arg(Arg::new("bytes").required(true).num_args(1..).help("Hex bytes, e.g. 01 03 00 00 00 01")),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(Arg::new("path").required(true).value_name("FILE")),
        )
}
