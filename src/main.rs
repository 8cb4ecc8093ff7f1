use iolog::IologBuilder;
use std::process::exit;

fn main() {
    match IologBuilder::default().build() {
        Ok(mut iolog) => match iolog.run() {
            Ok(code) => exit(code),
            Err(e) => {
                eprintln!("iolog: {:#}", e);
                let errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(1);
                exit(errno);
            }
        },
        Err(e) => {
            eprintln!("iolog: {:#}", e);
            exit(1);
        }
    }
}
