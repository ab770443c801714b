// SPDX-License-Identifier: Apache-2.0
use edgelogd::cli;

fn main() {
    cli::main()
}
