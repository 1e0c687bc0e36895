extern crate kasp_hsm;

use std::process;

use kasp_hsm::cli::options::Options;

fn main() {
    let options = Options::from_args();
    let format = options.general.format;
    let status = options.run().report(format);
    process::exit(status);
}
